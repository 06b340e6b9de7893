//! Per-connection flow-control credits.
//!
//! The host grants credits with FLOW_CONTROL messages; each outbound
//! client message consumes one. A sender with no credit parks on the
//! gate until a grant arrives or its timeout expires.
//!
//! ```text
//!  host FLOW_CONTROL(n) ──▶ grant(n) ──▶ credits += n, wake waiters
//!  send()               ──▶ acquire(timeout) ──▶ credits -= 1
//! ```
//!
//! The gate has its own lock, separate from the registry, so a parked
//! sender never holds the registry.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{Duration, with_timeout};

use crate::error::HeciError;

/// Senders that can park on one connection without waking each other.
pub const MAX_PARKED: usize = 8;

struct CreditState {
    credits: u32,
    waiters: u32,
    wakers: MultiWakerRegistration<MAX_PARKED>,
}

/// Counting semaphore for one connection.
pub struct CreditGate {
    state: Mutex<CriticalSectionRawMutex, RefCell<CreditState>>,
}

impl CreditGate {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(CreditState {
                credits: 0,
                waiters: 0,
                wakers: MultiWakerRegistration::new(),
            })),
        }
    }

    /// Add `n` credits (a zero grant counts as one) and wake parked senders.
    /// Returns how many parked senders the grant can satisfy.
    pub fn grant(&self, n: u8) -> u32 {
        let n = u32::from(n.max(1));
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.credits = s.credits.saturating_add(n);
            s.wakers.wake();
            n.min(s.waiters)
        })
    }

    /// Return a credit taken by a send that did not go out.
    pub fn restore(&self) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.credits = s.credits.saturating_add(1);
            s.wakers.wake();
        });
    }

    /// Drop all credits (new connection, host reset, teardown).
    pub fn reset(&self) {
        self.state.lock(|s| s.borrow_mut().credits = 0);
    }

    pub fn available(&self) -> u32 {
        self.state.lock(|s| s.borrow().credits)
    }

    /// Number of senders currently parked.
    pub fn waiters(&self) -> u32 {
        self.state.lock(|s| s.borrow().waiters)
    }

    /// Take a credit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.credits > 0 {
                s.credits -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Take a credit, parking up to `timeout`. A timed-out wait consumes
    /// nothing.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), HeciError> {
        if self.try_acquire() {
            return Ok(());
        }

        self.state.lock(|s| s.borrow_mut().waiters += 1);
        let _parked = Parked(self);

        let wait = poll_fn(|cx| {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                if s.credits > 0 {
                    s.credits -= 1;
                    Poll::Ready(())
                } else {
                    s.wakers.register(cx.waker());
                    Poll::Pending
                }
            })
        });

        with_timeout(timeout, wait)
            .await
            .map_err(|_| HeciError::Timeout)
    }
}

impl Default for CreditGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Unparks on completion, timeout or cancellation.
struct Parked<'a>(&'a CreditGate);

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        self.0.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.waiters = s.waiters.saturating_sub(1);
        });
    }
}

// ── Tests ────────────────────────────────────────────────────
