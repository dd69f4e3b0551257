//! Bounded per-connection outbound queue with drop-oldest overflow.
//!
//! `tokio::sync::mpsc` can only reject the newest item when full. Each call
//! update supersedes the previous snapshot, so on overflow the oldest queued
//! frame is displaced instead. The queue is single-consumer: the connection's
//! send task is the only caller of [`OutboundQueue::pop`].
//!
//! Control frames (pings, pongs, acks, errors) travel in a separate small lane
//! that is drained first and never counts against the data capacity, so a
//! keepalive can never push out a call update.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the control lane. Overflow displaces the oldest control frame.
pub const CONTROL_CAPACITY: usize = 16;

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Enqueued with room to spare.
    Queued,
    /// Enqueued after displacing the oldest queued frame.
    Displaced,
    /// The queue is closed; the frame was discarded.
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    control: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO that never blocks the producer.
pub struct OutboundQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> OutboundQueue<T> {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                control: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a data frame without waiting. Displaces the oldest data frame
    /// when full.
    pub fn push(&self, item: T) -> PushOutcome {
        self.push_lane(item, false)
    }

    /// Enqueue a control frame. Only ever displaces another control frame.
    pub fn push_control(&self, item: T) -> PushOutcome {
        self.push_lane(item, true)
    }

    fn push_lane(&self, item: T, control: bool) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let (lane, capacity) = if control {
                (&mut state.control, CONTROL_CAPACITY)
            } else {
                (&mut state.items, self.capacity)
            };
            let outcome = if lane.len() >= capacity {
                lane.pop_front();
                PushOutcome::Displaced
            } else {
                PushOutcome::Queued
            };
            lane.push_back(item);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next frame, control lane first. Returns `None` once the
    /// queue is closed; frames still queued at close time are discarded.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.control.pop_front() {
                    return Some(item);
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            // notify_one stores a permit if no task is waiting yet, so a push
            // between the check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Close the queue and discard anything still buffered.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
            state.control.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Frames queued across both lanes.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.items.len() + state.control.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data lane capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
