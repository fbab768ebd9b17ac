use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::collaborators::ExternalRepositoryLock;

/// How a wait on the external lock ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// No other process holds the lock.
    Free,
    /// The holder asked for a release and the bounded poll ran out; the
    /// rebuild proceeds anyway.
    ReleaseTimedOut,
    Cancelled,
}

/// Blocks until the external lock is free.
///
/// Without a release request this waits as long as the lock is held. Once the
/// holder announces its release, polling is bounded by `release_wait`.
pub fn wait_for_external_lock(
    lock: &dyn ExternalRepositoryLock,
    poll_interval: Duration,
    release_wait: Duration,
    cancel: &CancellationToken,
) -> LockWait {
    let mut release_deadline: Option<Instant> = None;
    let mut logged = false;

    loop {
        if cancel.cancelled() {
            return LockWait::Cancelled;
        }
        if !lock.is_held_by_other() {
            return LockWait::Free;
        }

        if release_deadline.is_none() && lock.release_requested() {
            release_deadline = Some(Instant::now() + release_wait);
        }
        if let Some(deadline) = release_deadline {
            if Instant::now() >= deadline {
                log::warn!(
                    "external lock still held after release request waited_ms={}",
                    release_wait.as_millis()
                );
                return LockWait::ReleaseTimedOut;
            }
        }

        if !logged {
            log::debug!("waiting for external repository lock");
            logged = true;
        }
        thread::sleep(poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ShutdownSignal;
    use crate::testing::FakeLock;

    const POLL: Duration = Duration::from_millis(1);

    #[test]
    fn free_lock_returns_immediately() {
        let lock = FakeLock::default();
        let result =
            wait_for_external_lock(&lock, POLL, Duration::from_secs(5), &CancellationToken::noop());
        assert_eq!(result, LockWait::Free);
    }

    #[test]
    fn waits_until_holder_releases() {
        let lock = FakeLock::default();
        lock.hold_for_polls(5);
        let result =
            wait_for_external_lock(&lock, POLL, Duration::from_secs(5), &CancellationToken::noop());
        assert_eq!(result, LockWait::Free);
        assert!(lock.polls() >= 6);
    }

    #[test]
    fn release_request_bounds_the_wait() {
        let lock = FakeLock::default();
        lock.hold();
        lock.request_release();
        let result = wait_for_external_lock(
            &lock,
            POLL,
            Duration::from_millis(20),
            &CancellationToken::noop(),
        );
        assert_eq!(result, LockWait::ReleaseTimedOut);
    }

    #[test]
    fn shutdown_interrupts_the_wait() {
        let lock = FakeLock::default();
        lock.hold();
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = wait_for_external_lock(&lock, POLL, Duration::from_secs(5), &signal.token());
        assert_eq!(result, LockWait::Cancelled);
    }
}
