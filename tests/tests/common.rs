use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() { tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init(); }

/// Tracks how many operations run at once and the highest value seen
#[allow(unused)]
#[derive(Clone, Default)]
pub struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[allow(unused)]
impl Gauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) { self.current.fetch_sub(1, Ordering::SeqCst); }

    pub fn peak(&self) -> usize { self.peak.load(Ordering::SeqCst) }
}
