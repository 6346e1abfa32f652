pub mod json_lines;

pub use json_lines::JsonLinesCollector;

use serde_json::Value;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Record stream of one collection run and the task feeding it.
///
/// A closed `records` channel alone does not mean success: the producer may
/// have panicked mid-stream. Callers join `producer` to tell the two apart.
#[derive(Debug)]
pub struct Collection {
    pub records: mpsc::Receiver<Value>,
    pub producer: JoinHandle<()>,
}

impl Collection {
    /// Spawns `produce` on a fresh channel of `capacity` records.
    pub fn spawn<F, Fut>(capacity: usize, produce: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Value>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, records) = mpsc::channel(capacity.max(1));
        let producer = tokio::spawn(produce(tx));
        Self { records, producer }
    }
}

/// Producer of collected records for one job.
///
/// The record channel closes when enumeration finishes or `cancel` fires.
pub trait Collector: Send + Sync {
    fn collect(&self, cancel: CancellationToken) -> Collection;
}
