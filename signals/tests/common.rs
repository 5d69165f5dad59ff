use computable_signals::Watcher;

/// A batch of fresh watchers, handy for fan-out checks
#[allow(unused)]
pub fn watchers(n: usize) -> Vec<Watcher> { (0..n).map(|_| Watcher::new()).collect() }

#[allow(unused)]
pub fn changed_count(watchers: &[Watcher]) -> usize { watchers.iter().filter(|w| w.is_changed()).count() }
