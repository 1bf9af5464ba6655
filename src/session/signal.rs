//! One-shot completion signal.

use tokio::sync::oneshot;

/// Publishes a value to a waiting receiver at most once.
#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> Completion<T> {
    /// Create a signal and the receiver that waits on it.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Publish `value`. Returns `false` if a value was already published.
    ///
    /// A receiver that has gone away is not an error; the value is dropped.
    pub fn publish(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_published(&self) -> bool {
        self.tx.is_none()
    }
}
