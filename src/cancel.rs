//! Cancellation and deadline scopes for long running loops and store calls.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError, Sender};

/// A cancellation scope.
///
/// Cancelling a token cancels every token derived from it with
/// [CancelToken::child_token] or [CancelToken::child_with_timeout], but never
/// its parent. A token with a deadline reports itself cancelled once the
/// deadline passes.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    deadline: Option<Instant>,
    /// Dropped on cancellation, disconnecting `done`.
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a [CancelToken] is no longer live.
pub enum CancelReason {
    /// [CancelToken::cancel] was called on the token or one of its ancestors.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExceeded,
}

impl CancelToken {
    /// A root token with no deadline.
    pub fn new() -> Self {
        Self::with_deadline(None)
    }

    fn with_deadline(deadline: Option<Instant>) -> Self {
        let (trigger, done) = flume::bounded(0);

        Self {
            inner: Arc::new(Inner {
                deadline,
                trigger: Mutex::new(Some(trigger)),
                done,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token cancelled together with this one.
    pub fn child_token(&self) -> Self {
        self.child(self.inner.deadline)
    }

    /// A token cancelled together with this one, or once `timeout` elapses,
    /// whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now().checked_add(timeout);

        let deadline = match (self.inner.deadline, deadline) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };

        self.child(deadline)
    }

    // === Getters ===

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Why this token is no longer live, `None` while it still is.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.inner.done.is_disconnected() {
            return Some(CancelReason::Cancelled);
        }

        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Disconnects once the token is cancelled.
    ///
    /// Deadlines are not signalled through this channel, use
    /// [CancelToken::deadline] alongside it when selecting.
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done
    }

    // === Public Methods ===

    pub fn cancel(&self) {
        cancel(&self.inner);
    }

    /// Block for up to `timeout`, returning early with `true` if the token
    /// gets cancelled or its deadline passes in the meantime.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let wait = match self.remaining() {
            Some(remaining) => remaining.min(timeout),
            None => timeout,
        };

        match self.inner.done.recv_timeout(wait) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }

    // === Private Methods ===

    fn child(&self, deadline: Option<Instant>) -> Self {
        let child = Self::with_deadline(deadline);

        let mut children = lock(&self.inner.children);

        if lock(&self.inner.trigger).is_none() {
            drop(children);
            child.cancel();
        } else {
            children.retain(|weak| weak.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("deadline", &self.inner.deadline)
            .field("reason", &self.reason())
            .finish()
    }
}

fn cancel(inner: &Inner) {
    let trigger = lock(&inner.trigger).take();

    if trigger.is_none() {
        return;
    }
    drop(trigger);

    let children = std::mem::take(&mut *lock(&inner.children));

    for child in children.iter().filter_map(Weak::upgrade) {
        cancel(&child);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
