//! N-to-1 write coordination (spec §4.3): many workers produce results, one
//! writer commits them in batches. Mirrors the teacher's pattern of funneling
//! concurrent producers through a single `Arc<Mutex<...>>`-guarded structure
//! rather than letting every producer touch the database directly.

use crate::error::IngestError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct BatchProcessor<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Mutex<Instant>,
}

impl<T: Clone> BatchProcessor<T> {
    pub fn new(capacity: usize, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            batch_size,
            flush_interval,
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Enqueues `item`. If the bounded queue is already at capacity, flushes
    /// everything synchronously through `writer` first (spec §8: capacity
    /// triggers an immediate synchronous flush, never an unbounded wait or a
    /// silent drop), then inserts.
    pub fn push<F>(&self, item: T, writer: F) -> Result<(), IngestError>
    where
        F: FnOnce(&[T]) -> Result<(), IngestError>,
    {
        let at_capacity = {
            let queue = self.queue.lock().expect("batch queue mutex poisoned");
            queue.len() >= self.capacity
        };
        if at_capacity {
            self.force_flush(writer)?;
        }
        let mut queue = self.queue.lock().expect("batch queue mutex poisoned");
        queue.push_back(item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("batch queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once enough items have accumulated to flush on size grounds.
    pub fn should_flush_by_size(&self) -> bool {
        self.len() >= self.batch_size
    }

    /// True once `flush_interval` has elapsed since the last flush, even if
    /// the batch is smaller than `batch_size` (spec §4.3: "size, timer, or
    /// forced").
    pub fn should_flush_by_timer(&self) -> bool {
        let last = self.last_flush.lock().expect("batch timer mutex poisoned");
        !self.is_empty() && last.elapsed() >= self.flush_interval
    }

    /// Drains up to `batch_size` items and hands them to `writer`. On
    /// failure the drained items are re-prepended to the front of the queue
    /// so no item is silently lost (at-least-once delivery).
    pub fn flush<F>(&self, writer: F) -> Result<usize, IngestError>
    where
        F: FnOnce(&[T]) -> Result<(), IngestError>,
    {
        self.drain_and_write(self.batch_size, writer)
    }

    /// Drains everything regardless of `batch_size`, used on shutdown and by
    /// an explicit force-flush request.
    pub fn force_flush<F>(&self, writer: F) -> Result<usize, IngestError>
    where
        F: FnOnce(&[T]) -> Result<(), IngestError>,
    {
        let count = self.len();
        self.drain_and_write(count, writer)
    }

    fn drain_and_write<F>(&self, max: usize, writer: F) -> Result<usize, IngestError>
    where
        F: FnOnce(&[T]) -> Result<(), IngestError>,
    {
        let batch: Vec<T> = {
            let mut queue = self.queue.lock().expect("batch queue mutex poisoned");
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        };

        if batch.is_empty() {
            return Ok(0);
        }

        match writer(&batch) {
            Ok(()) => {
                *self.last_flush.lock().expect("batch timer mutex poisoned") = Instant::now();
                info!(count = batch.len(), "batch flushed");
                Ok(batch.len())
            }
            Err(e) => {
                warn!(error = %e, count = batch.len(), "batch flush failed, re-queuing");
                let mut queue = self.queue.lock().expect("batch queue mutex poisoned");
                for item in batch.into_iter().rev() {
                    queue.push_front(item);
                }
                Err(e)
            }
        }
    }

    /// Flushes everything currently queued, draining in `batch_size` chunks,
    /// for a clean shutdown. Stops at the first failing chunk.
    pub fn shutdown<F>(&self, mut writer: F) -> Result<usize, IngestError>
    where
        F: FnMut(&[T]) -> Result<(), IngestError>,
    {
        let mut total = 0;
        while !self.is_empty() {
            total += self.flush(&mut writer)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop(_batch: &[i32]) -> Result<(), IngestError> {
        Ok(())
    }

    #[test]
    fn push_and_flush_roundtrip() {
        let bp = BatchProcessor::new(10, 3, Duration::from_secs(60));
        bp.push(1, noop).unwrap();
        bp.push(2, noop).unwrap();
        assert!(!bp.should_flush_by_size());
        bp.push(3, noop).unwrap();
        assert!(bp.should_flush_by_size());

        let written = std::cell::RefCell::new(Vec::new());
        let n = bp.flush(|batch| {
            written.borrow_mut().extend_from_slice(batch);
            Ok(())
        }).unwrap();
        assert_eq!(n, 3);
        assert_eq!(*written.borrow(), vec![1, 2, 3]);
        assert!(bp.is_empty());
    }

    #[test]
    fn push_flushes_synchronously_when_at_capacity() {
        let bp = BatchProcessor::new(2, 10, Duration::from_secs(60));
        bp.push(1, noop).unwrap();
        bp.push(2, noop).unwrap();
        assert_eq!(bp.len(), 2);

        let written = std::cell::RefCell::new(Vec::new());
        bp.push(3, |batch| {
            written.borrow_mut().extend_from_slice(batch);
            Ok(())
        })
        .unwrap();

        // the capacity-triggered flush drained the first two before 3 was
        // appended, so the queue holds only the newly pushed item.
        assert_eq!(*written.borrow(), vec![1, 2]);
        assert_eq!(bp.len(), 1);
    }

    #[test]
    fn push_propagates_error_when_synchronous_flush_fails() {
        let bp = BatchProcessor::new(2, 10, Duration::from_secs(60));
        bp.push(1, noop).unwrap();
        bp.push(2, noop).unwrap();

        let result = bp.push(3, |_| Err(IngestError::Unexpected("boom".to_string())));
        assert!(result.is_err());
        // the failed flush re-queued 1 and 2; 3 was never inserted.
        assert_eq!(bp.len(), 2);
    }

    #[test]
    fn failed_flush_requeues_items_in_order() {
        let bp = BatchProcessor::new(10, 2, Duration::from_secs(60));
        bp.push("a", |_: &[&str]| Ok(())).unwrap();
        bp.push("b", |_: &[&str]| Ok(())).unwrap();

        let attempt = AtomicUsize::new(0);
        let err = bp.flush(|_| {
            attempt.fetch_add(1, Ordering::SeqCst);
            Err(IngestError::Unexpected("boom".to_string()))
        });
        assert!(err.is_err());
        assert_eq!(bp.len(), 2);

        let written = std::cell::RefCell::new(Vec::new());
        bp.flush(|batch| {
            written.borrow_mut().extend_from_slice(batch);
            Ok(())
        }).unwrap();
        assert_eq!(*written.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn force_flush_drains_more_than_batch_size() {
        let bp = BatchProcessor::new(10, 2, Duration::from_secs(60));
        for i in 0..5 {
            bp.push(i, noop).unwrap();
        }
        let n = bp.force_flush(|_| Ok(())).unwrap();
        assert_eq!(n, 5);
        assert!(bp.is_empty());
    }

    #[test]
    fn shutdown_drains_everything_in_chunks() {
        let bp = BatchProcessor::new(10, 2, Duration::from_secs(60));
        for i in 0..5 {
            bp.push(i, noop).unwrap();
        }
        let total = bp.shutdown(|_| Ok(())).unwrap();
        assert_eq!(total, 5);
        assert!(bp.is_empty());
    }

    #[test]
    fn timer_flush_false_when_empty() {
        let bp: BatchProcessor<i32> = BatchProcessor::new(10, 2, Duration::from_millis(1));
        assert!(!bp.should_flush_by_timer());
    }
}
