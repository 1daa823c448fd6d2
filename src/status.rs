// src/status.rs

//! In-flight request statuses.
//!
//! A status is created and registered in its channel's request registry
//! before the request is handed to the peer, so a response can never be
//! observed before its request is known. It completes exactly once, by
//! response, failure, cancellation, or timeout; synchronous callers park
//! on its condvar, asynchronous callers poll or keep the handle. On
//! completion the status removes itself from the channel registry.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelCore;
use crate::error::{Error, Result};
use crate::message::Message;

enum StatusState {
    Waiting,
    /// Response arrived; the slot empties when the waiter takes it.
    Complete(Option<Box<dyn Message>>),
    Failed(Error),
}

/// Handle for one in-flight request.
pub struct RequestStatus {
    request_id: i64,
    channel: Weak<ChannelCore>,
    deadline: Mutex<Option<Instant>>,
    request: Mutex<Option<Box<dyn Message>>>,
    state: Mutex<StatusState>,
    cond: Condvar,
}

impl RequestStatus {
    pub(crate) fn new(
        request_id: i64,
        channel: Weak<ChannelCore>,
        request: Box<dyn Message>,
        deadline: Option<Instant>,
    ) -> Arc<Self> {
        Arc::new(RequestStatus {
            request_id,
            channel,
            deadline: Mutex::new(deadline),
            request: Mutex::new(Some(request)),
            state: Mutex::new(StatusState::Waiting),
            cond: Condvar::new(),
        })
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Absolute deadline, `None` for an infinite wait.
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub(crate) fn set_deadline(&self, deadline: Option<Instant>) {
        *self.deadline.lock() = deadline;
    }

    /// Borrow the pending request message, if the status still holds one.
    pub fn with_request<R>(&self, f: impl FnOnce(&dyn Message) -> R) -> Option<R> {
        let guard = self.request.lock();
        guard.as_deref().map(f)
    }

    /// True once a response, failure, or cancellation landed.
    pub fn is_complete(&self) -> bool {
        !matches!(*self.state.lock(), StatusState::Waiting)
    }

    /// The failure, if the status completed exceptionally.
    pub fn error(&self) -> Option<Error> {
        match &*self.state.lock() {
            StatusState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// True if a successful response landed (taken or not).
    pub fn succeeded(&self) -> bool {
        matches!(*self.state.lock(), StatusState::Complete(_))
    }

    /// Deliver the response. Late deliveries after completion or
    /// cancellation are discarded silently.
    pub(crate) fn set_response(&self, response: Box<dyn Message>) {
        let transitioned = {
            let mut state = self.state.lock();
            if matches!(*state, StatusState::Waiting) {
                *state = StatusState::Complete(Some(response));
                self.cond.notify_all();
                true
            } else {
                false
            }
        };
        if transitioned {
            self.unregister();
        }
    }

    /// Cancel with a cause. Cancelling an already-completed status has no
    /// observable effect. Returns true if this call completed the status.
    pub fn cancel(&self, cause: Error) -> bool {
        let transitioned = {
            let mut state = self.state.lock();
            if matches!(*state, StatusState::Waiting) {
                *state = StatusState::Failed(cause);
                self.cond.notify_all();
                true
            } else {
                false
            }
        };
        if transitioned {
            self.unregister();
        }
        transitioned
    }

    /// Park the calling thread until completion or the deadline.
    ///
    /// On timeout the status cancels itself, so a later-arriving response
    /// is discarded.
    pub fn wait_for_response(&self) -> Result<Box<dyn Message>> {
        let deadline = self.deadline();
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                StatusState::Complete(slot) => {
                    return slot
                        .take()
                        .ok_or(Error::IllegalState("response already consumed"));
                }
                StatusState::Failed(e) => return Err(e.clone()),
                StatusState::Waiting => match deadline {
                    None => self.cond.wait(&mut state),
                    Some(d) => {
                        if self.cond.wait_until(&mut state, d).timed_out()
                            && matches!(*state, StatusState::Waiting)
                        {
                            *state = StatusState::Failed(Error::Timeout);
                            self.cond.notify_all();
                            drop(state);
                            self.unregister();
                            return Err(Error::Timeout);
                        }
                    }
                },
            }
        }
    }

    /// Re-arm a completed status so the same request id can continue a
    /// partial-response stream.
    pub(crate) fn rearm(&self, deadline: Option<Instant>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                StatusState::Waiting => {
                    return Err(Error::IllegalState("request is still in flight"))
                }
                StatusState::Failed(e) => return Err(e.clone()),
                StatusState::Complete(_) => *state = StatusState::Waiting,
            }
        }
        self.set_deadline(deadline);
        Ok(())
    }

    fn unregister(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unregister_status(self.request_id);
        }
    }
}

impl std::fmt::Debug for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            StatusState::Waiting => "waiting",
            StatusState::Complete(_) => "complete",
            StatusState::Failed(_) => "failed",
        };
        f.debug_struct("RequestStatus")
            .field("request_id", &self.request_id)
            .field("state", &state)
            .finish()
    }
}
