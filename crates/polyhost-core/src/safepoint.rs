//! Cooperative cancellation and interruption
//!
//! Guest code polls [`Env::poll_safepoint`](crate::Env::poll_safepoint) in
//! long-running loops. A poll fails with `Error::Cancelled` once the context is
//! being cancelled and with `Error::Interrupted` while an interrupt is pending.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::ContextInner;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct Safepoint {
    cancelled: AtomicBool,
    interrupts: AtomicUsize,
}

impl Safepoint {
    pub(crate) fn poll(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        if self.interrupts.load(Ordering::Acquire) > 0 {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn begin_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
    }

    fn end_interrupt(&self) {
        self.interrupts.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ContextInner {
    /// Sleep in poll-interval steps, failing as soon as a poll does
    pub(crate) fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let step = self.engine.config.safepoint_poll_interval();
        let mut state = self.state.lock();
        loop {
            self.safepoint.poll()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let wait = step.min(deadline - now);
            let _ = self.changed.wait_for(&mut state, wait);
        }
    }

    /// Interrupt executing threads and wait until none is left in the context
    pub(crate) fn interrupt(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        if state.thread(me).is_some_and(|t| t.entered > 0) {
            return Err(Error::illegal_state(
                "Cannot interrupt context from a thread where the context is active.",
            ));
        }
        self.safepoint.begin_interrupt();
        self.changed.notify_all();
        tracing::debug!(context = %self.id, ?timeout, "interrupt requested");

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut result = Ok(());
        while state.any_thread_active() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && state.any_thread_active()
                    {
                        result = Err(Error::InterruptTimeout(timeout));
                        break;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        drop(state);
        self.safepoint.end_interrupt();
        result
    }
}
