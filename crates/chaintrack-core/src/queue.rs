//! Bounded queue with non-blocking push and single-shot close.
//!
//! The producer half never waits: a push onto a full queue hands the item
//! back so the caller can signal the drop. Closing is idempotent and safe to
//! race from several threads; exactly one caller observes the transition.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Why a push did not enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue is at capacity.
    Full(T),
    /// The queue was closed (by the producer or by dropping the receiver).
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Closed(t) => t,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

/// Create a queue holding at most `capacity` items (minimum 1).
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender {
            tx: Mutex::new(Some(tx)),
        },
        QueueReceiver { rx },
    )
}

/// Producer half.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T> QueueSender<T> {
    /// Enqueue without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PushError::Closed(item));
        };
        tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(t) => PushError::Full(t),
            mpsc::error::TrySendError::Closed(t) => PushError::Closed(t),
        })
    }

    /// Close the queue. Returns `true` only for the call that closed it.
    ///
    /// Items already queued stay readable; the receiver sees end-of-stream
    /// once they are drained.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Wait for the next item. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next item if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn full_queue_returns_item() {
        let (tx, mut rx) = bounded(2);
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        let err = tx.try_push(3).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 3);
        assert_eq!(rx.try_recv(), Some(1));
        tx.try_push(4).unwrap();
    }

    #[tokio::test]
    async fn close_is_single_shot() {
        let (tx, mut rx) = bounded(4);
        tx.try_push("a").unwrap();
        assert!(tx.close());
        assert!(!tx.close());
        assert!(tx.is_closed());
        assert_eq!(tx.try_push("b"), Err(PushError::Closed("b")));
        // Queued items survive the close.
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn dropped_receiver_reads_as_closed() {
        let (tx, rx) = bounded::<u8>(1);
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.try_push(1), Err(PushError::Closed(1))));
    }

    #[test]
    fn concurrent_close_has_one_winner() {
        let (tx, _rx) = bounded::<u8>(1);
        let tx = Arc::new(tx);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tx = Arc::clone(&tx);
                std::thread::spawn(move || tx.close())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|closed| *closed)
            .count();
        assert_eq!(winners, 1);
    }
}
