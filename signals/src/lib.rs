/*!
Change tracking primitives for the computable engine

A [`Watcher`] is a one-shot flag created for a single computation attempt. Observable
entities own a [`ChangeSource`] (or share a [`KeyedChangeSource`]) and attach the watchers of
whoever read them; when the entity changes, every attached watcher fires and the registry is
cleared. Sources only hold weak references, so dropping a watcher detaches it everywhere.

# Basic usage

```rust
use computable_signals::*;

let source = ChangeSource::new();
let watcher = Watcher::new();
source.attach_watcher(&watcher);
assert!(!watcher.is_changed());

source.mark_changed(Some("updated"));
assert!(watcher.is_changed());
assert_eq!(watcher.marker().as_deref(), Some("updated"));
```

# Hierarchical watchers

```rust
use computable_signals::*;

let users = KeyedChangeSource::<u64>::new();
let (alice, bob) = (Watcher::new(), Watcher::new());
users.attach_watcher(&1, &alice);
users.attach_watcher(&2, &bob);

// fires as soon as either child does
let page = Watcher::with_children([&alice, &bob]);
users.mark_changed(&2, None);
assert!(page.is_changed());
assert!(!alice.is_changed());
```
*/

mod change_source;
mod watcher;

pub use change_source::*;
pub use watcher::{Aborted, Watcher, WatcherId};

pub use tokio_util::sync::CancellationToken;
