//! Periodic polling of remote state, paused while nobody is interested in it.

mod computable_pool;
mod pool;

pub use computable_pool::{PollComputablePool, PollEntry, PollSource};
pub use pool::{ActorKey, PollActor, PollPool, PollPoolOptions};
