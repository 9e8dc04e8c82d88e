use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

/// Per-peer outbound queue that batches small messages over a short flush
/// window. The first message on an idle link flushes immediately; messages
/// arriving within the window of the last flush buffer and flush together.
///
/// Handlers never see this: they append messages per peer and the batching
/// stays a transport concern.
pub struct BatchedSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for BatchedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> BatchedSender<T> {
    /// Spawn the batching task. Batches arrive on the returned receiver in
    /// send order; dropping the receiver stops the task.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<T>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<T>>();

        tokio::spawn(async move {
            let mut last_flush: Option<Instant> = None;
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                let link_busy = last_flush.is_some_and(|t| t.elapsed() < window);
                if link_busy {
                    let deadline = Instant::now() + window;
                    loop {
                        tokio::select! {
                            _ = sleep_until(deadline) => break,
                            more = rx.recv() => match more {
                                Some(m) => batch.push(m),
                                None => break,
                            }
                        }
                    }
                }
                while let Ok(m) = rx.try_recv() {
                    batch.push(m);
                }
                last_flush = Some(Instant::now());
                if out_tx.send(batch).is_err() {
                    return;
                }
            }
        });

        (Self { tx }, out_rx)
    }

    /// Queue a message. Returns false once the batching task is gone.
    pub fn send(&self, msg: T) -> bool {
        self.tx.send(msg).is_ok()
    }
}
