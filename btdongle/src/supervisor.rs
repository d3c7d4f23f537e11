//! Fault and recovery supervision.
//!
//! The supervisor owns the board-level recovery actions: toggling the
//! chip reset line and holding the system awake while recovery runs.
//! Both are injected at construction, so the crate never reaches for
//! platform symbols itself.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{HardwareErrorCode, Result};
use crate::session::{LinkState, PowerState, Session};

/// Board-level chip reset line.
pub trait ResetLine: Send + Sync {
    /// Assert the reset line.
    fn assert(&self) -> Result<()>;
    /// Release the reset line.
    fn release(&self) -> Result<()>;
}

/// Keeps the system awake while recovery or wake processing runs.
pub trait WakeLock: Send + Sync {
    /// Acquire the lock; nested acquires are the implementor's concern.
    fn acquire(&self);
    /// Release the lock.
    fn release(&self);
}

/// Hold time for the reset line, then settle time before the chip is
/// probed again.
const RESET_PULSE: Duration = Duration::from_millis(20);
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Drives forced recovery for a session.
pub struct FaultSupervisor {
    session: Arc<Session>,
    reset_line: Arc<dyn ResetLine>,
    wake_lock: Arc<dyn WakeLock>,
}

impl FaultSupervisor {
    /// Create a supervisor with the injected board hooks.
    pub fn new(
        session: Arc<Session>,
        reset_line: Arc<dyn ResetLine>,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            session,
            reset_line,
            wake_lock,
        }
    }

    /// The shared wake lock, for collaborators that must hold the
    /// system awake across a failed low-power transition.
    pub fn wake_lock(&self) -> Arc<dyn WakeLock> {
        Arc::clone(&self.wake_lock)
    }

    /// Force a chip reset, recording `cause` as the sticky error unless
    /// one is already pending. Blocked readers are woken so the
    /// synthetic hardware-error event is seen promptly.
    pub fn force_chip_reset(&self, cause: HardwareErrorCode) -> Result<()> {
        warn!("forcing chip reset, cause {cause:?}");
        self.session.latch_error(cause);
        self.session.set_power_state(PowerState::PowerOff);
        self.session.set_link_state(LinkState::Disconnected);

        self.reset_line.assert()?;
        thread::sleep(RESET_PULSE);
        self.reset_line.release()?;
        thread::sleep(RESET_SETTLE);

        self.session.buffer().wake_readers();
        info!("chip reset done");
        Ok(())
    }

    /// Escalation path for a failed standby transition: never leave the
    /// chip in an ambiguous low-power state. The wake lock is held
    /// across the reset so the system cannot sleep mid-recovery.
    pub fn recover_woble_failure(&self) -> Result<()> {
        self.wake_lock.acquire();
        let result = self.force_chip_reset(HardwareErrorCode::WobleFailure);
        self.wake_lock.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub struct CountingResetLine {
        pub asserts: AtomicU32,
        pub releases: AtomicU32,
    }

    impl ResetLine for CountingResetLine {
        fn assert(&self) -> Result<()> {
            self.asserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct CountingWakeLock {
        pub acquires: AtomicU32,
        pub releases: AtomicU32,
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self) {
            self.acquires.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor_fixture() -> (
        FaultSupervisor,
        Arc<Session>,
        Arc<CountingResetLine>,
        Arc<CountingWakeLock>,
    ) {
        let session = Arc::new(Session::new(4096));
        session.set_link_state(LinkState::Working);
        let reset = Arc::new(CountingResetLine::default());
        let lock = Arc::new(CountingWakeLock::default());
        let supervisor = FaultSupervisor::new(
            Arc::clone(&session),
            Arc::clone(&reset) as Arc<dyn ResetLine>,
            Arc::clone(&lock) as Arc<dyn WakeLock>,
        );
        (supervisor, session, reset, lock)
    }

    #[test]
    fn test_force_reset_latches_cause_and_pulses_line() {
        let (supervisor, session, reset, _lock) = supervisor_fixture();
        supervisor
            .force_chip_reset(HardwareErrorCode::ChipReset)
            .unwrap();

        assert_eq!(reset.asserts.load(Ordering::SeqCst), 1);
        assert_eq!(reset.releases.load(Ordering::SeqCst), 1);
        assert_eq!(session.take_error(), Some(HardwareErrorCode::ChipReset));
        assert_eq!(session.power_state(), PowerState::PowerOff);
        assert_eq!(session.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn test_first_cause_survives_forced_reset() {
        let (supervisor, session, _reset, _lock) = supervisor_fixture();
        session.latch_error(HardwareErrorCode::CoreDump);
        supervisor
            .force_chip_reset(HardwareErrorCode::ChipReset)
            .unwrap();
        assert_eq!(session.take_error(), Some(HardwareErrorCode::CoreDump));
    }

    #[test]
    fn test_woble_escalation_holds_wake_lock() {
        let (supervisor, session, reset, lock) = supervisor_fixture();
        supervisor.recover_woble_failure().unwrap();

        assert_eq!(lock.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert_eq!(reset.asserts.load(Ordering::SeqCst), 1);
        assert_eq!(session.take_error(), Some(HardwareErrorCode::WobleFailure));
    }
}
