//! Small helpers shared by the session, scheduler and aggregator

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::DiagError;

/// Longest time a blocking wait sleeps before looking at its [CancelToken] again
pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cooperative cancellation handle.
///
/// A token is cancelled either explicitly by [CancelToken::cancel] or implicitly once its
/// deadline passes. Clones share the cancellation flag, so cancelling one clone cancels all
/// of them. Every blocking receive in the crate bounds its wait by the token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Creates a token without a deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token which expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Creates a token which expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Cancels the token and every clone of it
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true if the token was cancelled or its deadline has passed
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire) || self.is_expired()
    }

    /// Returns true only if the deadline of the token has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Deadline of the token, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Creates a token sharing the cancellation flag of this one, which additionally
    /// expires `timeout` from now
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            flag: self.flag.clone(),
            deadline: Some(self.bound(Instant::now() + timeout)),
        }
    }

    /// Error describing why the token fired
    pub(crate) fn error(&self) -> DiagError {
        if self.is_expired() {
            DiagError::Timeout
        } else {
            DiagError::Cancelled
        }
    }

    /// Clamps `deadline` to the deadline of the token
    pub fn bound(&self, deadline: Instant) -> Instant {
        match self.deadline {
            Some(own) => own.min(deadline),
            None => deadline,
        }
    }

    /// Sleeps for `duration`, waking early if the token is cancelled.
    ///
    /// Returns false if the sleep was cut short
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            std::thread::sleep((end - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// A vehicle worker that panics is already reported as a failure, so its poisoned
/// locks must not take the rest of the fleet down with it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parses an unsigned integer written either in decimal or as `0x` prefixed hex
pub(crate) fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Best effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_u32("0x7E0"), Some(0x7E0));
        assert_eq!(parse_u32(" 2016 "), Some(2016));
        assert_eq!(parse_u32("0xZZ"), None);
    }

    #[test]
    fn cancel_wakes_sleep() {
        let token = CancelToken::new();
        let other = token.clone();
        let t = std::thread::spawn(move || other.sleep(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(30));
        token.cancel();
        assert!(!t.join().unwrap());
    }

    #[test]
    fn deadline_expires() {
        let token = CancelToken::with_timeout(Duration::from_millis(10));
        assert!(!token.is_expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(token.is_expired());
        assert!(token.is_cancelled());
        assert!(token.error().is_timeout());
    }

    #[test]
    fn child_shares_flag() {
        let parent = CancelToken::new();
        let child = parent.child(Duration::from_secs(60));
        assert!(child.deadline().is_some());
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.error(), DiagError::Cancelled));
    }
}
