use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    pub flush_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

/// Groups items from `input` into batches of at most `config.max_size`.
///
/// A partial batch is flushed once no new item has arrived for
/// `config.flush_timeout`, and whatever remains is flushed when `input`
/// closes. The output channel holds a single batch, so a slow consumer
/// stalls the producer. Cancellation drops the partial batch and closes the
/// output. The returned handle resolves once the batching task exits.
pub fn batch<T: Send + 'static>(
    cancel: CancellationToken,
    mut input: mpsc::Receiver<T>,
    config: BatchConfig,
) -> (mpsc::Receiver<Vec<T>>, JoinHandle<()>) {
    let max_size = config.max_size.max(1);
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        let mut current: Vec<T> = Vec::with_capacity(max_size);
        let mut deadline = Instant::now() + config.flush_timeout;
        let mut emitted = 0usize;

        loop {
            let flush = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(pending = current.len(), "Batching cancelled");
                    return;
                }
                next = input.recv() => match next {
                    Some(item) => {
                        current.push(item);
                        deadline = Instant::now() + config.flush_timeout;
                        current.len() >= max_size
                    }
                    None => {
                        if !current.is_empty() {
                            send_batch(&cancel, &tx, std::mem::take(&mut current)).await;
                            emitted += 1;
                        }
                        debug!(batches = emitted, "Batch input closed");
                        return;
                    }
                },
                () = sleep_until(deadline), if !current.is_empty() => {
                    trace!(size = current.len(), "Flush timeout reached");
                    true
                }
            };

            if flush {
                let full = std::mem::replace(&mut current, Vec::with_capacity(max_size));
                if !send_batch(&cancel, &tx, full).await {
                    return;
                }
                emitted += 1;
            }
        }
    });

    (rx, handle)
}

async fn send_batch<T>(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Vec<T>>,
    batch: Vec<T>,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}
