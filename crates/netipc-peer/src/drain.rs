//! Write-completion queue.
//!
//! Every queued write carries a completion sender. The writer task moves the
//! senders of one batch into a [`DrainQueue`] and, once the batch has been
//! flushed to the transport, settles them in the order they were written.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::{PeerError, Result};

pub(crate) type Completion = oneshot::Sender<Result<()>>;

#[derive(Default)]
pub(crate) struct DrainQueue {
    waiting: VecDeque<Completion>,
}

impl DrainQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, done: Completion) {
        self.waiting.push_back(done);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// The transport drained: resolve every waiter, oldest first.
    pub(crate) fn drained(&mut self) {
        while let Some(done) = self.waiting.pop_front() {
            let _ = done.send(Ok(()));
        }
    }

    /// The write failed: reject every waiter, oldest first.
    pub(crate) fn fail(&mut self, make_err: impl Fn() -> PeerError) {
        while let Some(done) = self.waiting.pop_front() {
            let _ = done.send(Err(make_err()));
        }
    }
}
