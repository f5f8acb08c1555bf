//! Bounded per-peer outbound queue.
//!
//! Capacity is tracked by a counting semaphore separate from the deque mutex, so
//! a producer blocked on a full queue never holds the lock the consumer needs.

use crate::config::{QueueConfig, QueueMode};
use crate::error::{Result, TransportError};
use crate::event::{CallbackSlot, EndpointCallback, EndpointEvent};
use crate::sync::Semaphore;
use parking_lot::{Condvar, Mutex};
use pdu_wire::Pdu;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Queued PDU with its enqueue time
#[derive(Debug, Clone)]
pub struct PduHolder {
    pdu: Arc<Pdu>,
    enqueued_at: Instant,
}

impl PduHolder {
    fn new(pdu: Arc<Pdu>) -> Self {
        Self {
            pdu,
            enqueued_at: Instant::now(),
        }
    }

    /// The queued PDU
    pub fn pdu(&self) -> &Arc<Pdu> {
        &self.pdu
    }

    /// Take the PDU out of the holder
    pub fn into_pdu(self) -> Arc<Pdu> {
        self.pdu
    }

    /// Time spent in the queue so far
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Whether the entry outlived `timeout`
    pub fn is_expired(&self, timeout: Option<Duration>) -> bool {
        timeout.is_some_and(|t| self.age() > t)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<PduHolder>,
    closed: bool,
}

/// Outbound queue of one peer
#[derive(Debug)]
pub struct PduQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    slots: Semaphore,
    callback: CallbackSlot<EndpointEvent>,
}

impl PduQueue {
    /// Create an empty queue
    pub fn new(config: QueueConfig) -> Self {
        let slots = Semaphore::new(config.max_size);
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            slots,
            callback: CallbackSlot::new(),
        }
    }

    /// Register the callback receiving `SendError` events for dropped PDUs
    pub fn set_event_callback(&self, callback: EndpointCallback) {
        self.callback.set(callback);
    }

    /// Overflow behavior of this queue
    pub fn mode(&self) -> QueueMode {
        self.config.mode
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Append a PDU, applying the overflow mode when the queue is full
    pub fn enqueue_pdu(&self, pdu: Arc<Pdu>) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Shutdown);
        }

        match self.config.mode {
            QueueMode::Throw => {
                if !self.slots.try_acquire() {
                    return Err(TransportError::QueueFull(self.config.max_size));
                }
            }
            QueueMode::Block => {
                if !self.slots.acquire() {
                    return Err(TransportError::Shutdown);
                }
            }
            QueueMode::Callback => {
                if !self.slots.try_acquire() {
                    if !self.callback.is_set() {
                        return Err(TransportError::NoEventCallback);
                    }
                    debug!("Queue full, reporting PDU opcode {} as send error", pdu.opcode());
                    self.callback.fire(EndpointEvent::send_error(pdu));
                    return Ok(());
                }
            }
        }

        {
            let mut state = self.state.lock();
            if !state.closed {
                state.entries.push_back(PduHolder::new(pdu));
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
        }
        self.slots.release(1);
        Err(TransportError::Shutdown)
    }

    /// Block until a PDU is available; `None` once the queue is closed
    pub fn wait_for_next_pdu(&self) -> Option<PduHolder> {
        self.take_next(true)
    }

    /// Dequeue without blocking
    pub fn get_next_pdu(&self) -> Option<PduHolder> {
        self.take_next(false)
    }

    /// Drop every queued entry and free their slots
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.state.lock().entries);
        self.slots.release(drained.len());
        drained.len()
    }

    /// Close the queue, waking the consumer and every blocked producer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.slots.close();
        self.clear();
    }

    fn take_next(&self, block: bool) -> Option<PduHolder> {
        loop {
            let mut expired = Vec::new();
            let next = {
                let mut state = self.state.lock();
                loop {
                    if state.closed {
                        break None;
                    }
                    match state.entries.pop_front() {
                        Some(holder) if holder.is_expired(self.config.pdu_timeout) => {
                            expired.push(holder)
                        }
                        Some(holder) => break Some(holder),
                        None if !block || !expired.is_empty() => break None,
                        None => self.not_empty.wait(&mut state),
                    }
                }
            };

            let removed = expired.len() + usize::from(next.is_some());
            self.slots.release(removed);

            let retry = block && next.is_none() && !expired.is_empty();
            self.report_expired(expired);
            if !retry {
                return next;
            }
        }
    }

    fn report_expired(&self, expired: Vec<PduHolder>) {
        for holder in expired {
            warn!(
                "Dropping PDU opcode {} queued {:?} ago",
                holder.pdu.opcode(),
                holder.age()
            );
            self.callback.fire(EndpointEvent::send_error(holder.pdu));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PduEventType;
    use bytes::Bytes;
    use std::thread;

    fn config(max_size: usize, mode: QueueMode) -> QueueConfig {
        QueueConfig {
            max_size,
            mode,
            pdu_timeout: None,
        }
    }

    fn pdu(opcode: u32) -> Arc<Pdu> {
        Arc::new(Pdu::new(opcode, Bytes::new()))
    }

    fn recording(queue: &PduQueue) -> Arc<Mutex<Vec<EndpointEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        queue.set_event_callback(Arc::new(move |event| sink.lock().push(event)));
        events
    }

    #[test]
    fn test_fifo_order() {
        let queue = PduQueue::new(config(10, QueueMode::Throw));
        for opcode in 1..=3 {
            queue.enqueue_pdu(pdu(opcode)).unwrap();
        }
        let order: Vec<_> = (0..3)
            .map(|_| queue.get_next_pdu().unwrap().pdu().opcode())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.get_next_pdu().is_none());
    }

    #[test]
    fn test_throw_mode_rejects_when_full() {
        let queue = PduQueue::new(config(2, QueueMode::Throw));
        queue.enqueue_pdu(pdu(1)).unwrap();
        queue.enqueue_pdu(pdu(2)).unwrap();

        assert!(matches!(
            queue.enqueue_pdu(pdu(3)),
            Err(TransportError::QueueFull(2))
        ));
        assert_eq!(queue.len(), 2);

        // dequeue frees exactly one slot
        queue.get_next_pdu().unwrap();
        queue.enqueue_pdu(pdu(3)).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_block_mode_waits_for_space() {
        let queue = Arc::new(PduQueue::new(config(1, QueueMode::Block)));
        queue.enqueue_pdu(pdu(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.enqueue_pdu(pdu(2)))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.wait_for_next_pdu().unwrap().pdu().opcode(), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(queue.wait_for_next_pdu().unwrap().pdu().opcode(), 2);
    }

    #[test]
    fn test_callback_mode_reports_new_pdu() {
        let queue = PduQueue::new(config(1, QueueMode::Callback));
        let events = recording(&queue);
        let first = pdu(1);
        let second = pdu(2);

        queue.enqueue_pdu(first).unwrap();
        queue.enqueue_pdu(second.clone()).unwrap();
        assert_eq!(queue.len(), 1);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PduEventType::SendError);
        assert!(Arc::ptr_eq(events[0].pdu.as_ref().unwrap(), &second));
    }

    #[test]
    fn test_callback_mode_requires_callback() {
        let queue = PduQueue::new(config(1, QueueMode::Callback));
        queue.enqueue_pdu(pdu(1)).unwrap();
        assert!(matches!(
            queue.enqueue_pdu(pdu(2)),
            Err(TransportError::NoEventCallback)
        ));
    }

    #[test]
    fn test_expired_entries_dropped_on_dequeue() {
        let queue = PduQueue::new(QueueConfig {
            max_size: 4,
            mode: QueueMode::Throw,
            pdu_timeout: Some(Duration::from_millis(20)),
        });
        let events = recording(&queue);

        queue.enqueue_pdu(pdu(1)).unwrap();
        queue.enqueue_pdu(pdu(2)).unwrap();
        thread::sleep(Duration::from_millis(40));
        queue.enqueue_pdu(pdu(3)).unwrap();

        assert_eq!(queue.get_next_pdu().unwrap().pdu().opcode(), 3);
        let dropped: Vec<_> = events
            .lock()
            .iter()
            .map(|e| (e.kind, e.pdu.as_ref().unwrap().opcode()))
            .collect();
        assert_eq!(
            dropped,
            vec![(PduEventType::SendError, 1), (PduEventType::SendError, 2)]
        );

        // all slots were released
        for opcode in 0..4 {
            queue.enqueue_pdu(pdu(opcode)).unwrap();
        }
    }

    #[test]
    fn test_blocking_dequeue_skips_expired_and_keeps_waiting() {
        let queue = Arc::new(PduQueue::new(QueueConfig {
            max_size: 4,
            mode: QueueMode::Throw,
            pdu_timeout: Some(Duration::from_millis(10)),
        }));
        let events = recording(&queue);
        queue.enqueue_pdu(pdu(1)).unwrap();
        thread::sleep(Duration::from_millis(30));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_for_next_pdu().map(|h| h.pdu().opcode()))
        };
        thread::sleep(Duration::from_millis(30));
        queue.enqueue_pdu(pdu(2)).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(2));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_clear_releases_blocked_producer() {
        let queue = Arc::new(PduQueue::new(config(1, QueueMode::Block)));
        queue.enqueue_pdu(pdu(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.enqueue_pdu(pdu(2)))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.clear(), 1);

        producer.join().unwrap().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_wakes_everyone() {
        let queue = Arc::new(PduQueue::new(config(1, QueueMode::Block)));

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_for_next_pdu().is_none())
        };
        thread::sleep(Duration::from_millis(30));
        queue.close();
        assert!(consumer.join().unwrap());

        assert!(matches!(
            queue.enqueue_pdu(pdu(1)),
            Err(TransportError::Shutdown)
        ));
    }

    #[test]
    fn test_close_fails_blocked_producer() {
        let queue = Arc::new(PduQueue::new(config(1, QueueMode::Block)));
        queue.enqueue_pdu(pdu(1)).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.enqueue_pdu(pdu(2)))
        };
        thread::sleep(Duration::from_millis(30));
        queue.close();

        assert!(matches!(
            producer.join().unwrap(),
            Err(TransportError::Shutdown)
        ));
        assert!(queue.is_empty());
    }
}
