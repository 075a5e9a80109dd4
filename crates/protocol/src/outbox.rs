//! Link state machine with a buffered outbox.
//!
//! Both ends of the relay link hold frames that were submitted while the
//! link was not ready. The outbox hands them back, in submission order,
//! exactly once when the link becomes ready.

use std::collections::VecDeque;

/// Link state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport open, handshake not yet acknowledged.
    Connecting,
    /// Handshake acknowledged; frames go straight to the transport.
    Ready,
}

/// What the caller must do with a submitted item.
#[derive(Debug, PartialEq, Eq)]
pub enum Submit<T> {
    /// The link is ready: write this item now.
    Transmit(T),
    /// The item was queued until the next ready transition.
    Buffered,
}

/// Ordered buffer of items awaiting a ready link.
#[derive(Debug)]
pub struct Outbox<T> {
    state: LinkState,
    pending: VecDeque<T>,
    capacity: usize,
}

impl<T> Outbox<T> {
    /// Creates an outbox holding at most `capacity` buffered items.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: LinkState::Disconnected,
            pending: VecDeque::new(),
            capacity,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Transport opened; handshake in progress.
    pub fn begin_connect(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// Handshake acknowledged. Returns the buffered items in FIFO order;
    /// the caller must transmit them before anything submitted afterwards.
    pub fn mark_ready(&mut self) -> Vec<T> {
        self.state = LinkState::Ready;
        self.pending.drain(..).collect()
    }

    /// Transport lost. Buffered items are kept for the next ready transition.
    pub fn mark_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
    }

    /// Submits an item.
    ///
    /// Returns `Err(item)` when the link is not ready and the buffer is full.
    pub fn submit(&mut self, item: T) -> Result<Submit<T>, T> {
        if self.state == LinkState::Ready {
            return Ok(Submit::Transmit(item));
        }
        if self.pending.len() >= self.capacity {
            return Err(item);
        }
        self.pending.push_back(item);
        Ok(Submit::Buffered)
    }

    /// Puts back items whose physical write failed, ahead of everything
    /// else, and leaves the ready state so later submissions queue behind
    /// them.
    pub fn requeue_front(&mut self, items: impl IntoIterator<Item = T>) {
        let items: Vec<T> = items.into_iter().collect();
        for item in items.into_iter().rev() {
            self.pending.push_front(item);
        }
        if self.state == LinkState::Ready {
            self.state = LinkState::Connecting;
        }
    }

    /// Drops all buffered items (used when the owner shuts down for good).
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}
