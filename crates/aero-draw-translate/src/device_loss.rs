use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, Result, TranslateError};
use crate::hal::NativeDevice;
use crate::stats::TranslateStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Active,
    Lost,
    Resetting,
}

/// Bounded retry policy for device resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetPolicy {
    pub max_attempts: u32,
    /// Sleep before each reset attempt.
    pub retry_delay: Duration,
    /// Sleep between status polls while the device still reports itself lost.
    pub poll_delay: Duration,
    /// Status polls per attempt before trying the reset anyway.
    pub max_polls: u32,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            poll_delay: Duration::from_millis(100),
            max_polls: 10,
        }
    }
}

/// Device-loss / reset state machine.
///
/// The coordinator only tracks the protocol; tearing down caches on loss and forcing state after a
/// reset is done by the owner (see `TranslationContext`), which reacts to the transitions reported
/// here.
#[derive(Debug)]
pub struct DeviceLossCoordinator {
    state: DeviceState,
    policy: ResetPolicy,
    fatal: bool,
}

impl DeviceLossCoordinator {
    pub fn new(policy: ResetPolicy) -> Self {
        Self {
            state: DeviceState::Active,
            policy,
            fatal: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn policy(&self) -> ResetPolicy {
        self.policy
    }

    pub fn is_active(&self) -> bool {
        self.state == DeviceState::Active
    }

    /// Reset was exhausted; the context can never become active again.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Record that the device was lost. Returns `true` only for the call that made the transition,
    /// so teardown runs once however many call sites observe the loss.
    pub fn notify_device_lost(&mut self, stats: &TranslateStats) -> bool {
        match self.state {
            DeviceState::Active => {
                warn!("native device lost");
                stats.inc_device_losses();
                self.state = DeviceState::Lost;
                true
            }
            DeviceState::Lost | DeviceState::Resetting => false,
        }
    }

    /// Drive the reset protocol to completion.
    ///
    /// Each attempt sleeps for the retry delay, polls the device status until it stops reporting
    /// plain loss (bounded), issues the reset and polls once more. `sleep` is injectable so tests
    /// never block.
    pub fn reset<D: NativeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        stats: &TranslateStats,
        mut sleep: impl FnMut(Duration),
    ) -> Result<()> {
        if self.fatal {
            return Err(TranslateError::ResetFailed {
                attempts: self.policy.max_attempts,
            });
        }
        if self.state == DeviceState::Active {
            return Ok(());
        }

        self.state = DeviceState::Resetting;
        for attempt in 1..=self.policy.max_attempts {
            stats.inc_resets_attempted();
            sleep(self.policy.retry_delay);

            let mut status = device.check_device_state();
            let mut polls = 0;
            while status == Err(DeviceError::DeviceLost) && polls < self.policy.max_polls {
                sleep(self.policy.poll_delay);
                status = device.check_device_state();
                polls += 1;
            }

            let result = device.reset().and_then(|()| device.check_device_state());
            match result {
                Ok(()) => {
                    info!(attempt, "native device reset");
                    stats.inc_resets_succeeded();
                    self.state = DeviceState::Active;
                    return Ok(());
                }
                Err(err) => {
                    debug!(attempt, %err, "device reset attempt failed");
                }
            }
        }

        error!(
            attempts = self.policy.max_attempts,
            "device reset failed; context is permanently lost"
        );
        self.state = DeviceState::Lost;
        self.fatal = true;
        Err(TranslateError::ResetFailed {
            attempts: self.policy.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{DeviceCall, DeviceCaps, RecordingDevice};

    fn quick_policy() -> ResetPolicy {
        ResetPolicy {
            retry_delay: Duration::ZERO,
            poll_delay: Duration::ZERO,
            ..ResetPolicy::default()
        }
    }

    #[test]
    fn notify_is_idempotent() {
        let stats = TranslateStats::new();
        let mut coordinator = DeviceLossCoordinator::new(quick_policy());
        assert!(coordinator.notify_device_lost(&stats));
        assert!(!coordinator.notify_device_lost(&stats));
        assert_eq!(coordinator.state(), DeviceState::Lost);
        assert_eq!(stats.snapshot().device_losses, 1);
    }

    #[test]
    fn reset_succeeds_after_failed_attempts() {
        let stats = TranslateStats::new();
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        device.lose_device(DeviceError::DeviceLost);
        device.fail_resets(2);

        let mut coordinator = DeviceLossCoordinator::new(quick_policy());
        coordinator.notify_device_lost(&stats);
        let mut sleeps = 0;
        coordinator
            .reset(&mut device, &stats, |_| sleeps += 1)
            .unwrap();

        assert_eq!(coordinator.state(), DeviceState::Active);
        assert_eq!(device.count_calls(|c| *c == DeviceCall::Reset), 3);
        let snap = stats.snapshot();
        assert_eq!(snap.resets_attempted, 3);
        assert_eq!(snap.resets_succeeded, 1);
        assert!(sleeps >= 3);
    }

    #[test]
    fn exhausted_reset_is_fatal() {
        let stats = TranslateStats::new();
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        device.lose_device(DeviceError::DeviceHung);
        device.fail_resets(10);

        let mut coordinator = DeviceLossCoordinator::new(quick_policy());
        coordinator.notify_device_lost(&stats);
        assert_eq!(
            coordinator.reset(&mut device, &stats, |_| {}),
            Err(TranslateError::ResetFailed { attempts: 3 })
        );
        assert_eq!(coordinator.state(), DeviceState::Lost);
        assert!(coordinator.is_fatal());

        // Refused without touching the device again.
        device.clear_calls();
        assert!(coordinator.reset(&mut device, &stats, |_| {}).is_err());
        assert!(device.calls().is_empty());
    }

    #[test]
    fn reset_while_active_is_a_no_op() {
        let stats = TranslateStats::new();
        let mut device = RecordingDevice::new(DeviceCaps::modern());
        let mut coordinator = DeviceLossCoordinator::new(quick_policy());
        coordinator.reset(&mut device, &stats, |_| {}).unwrap();
        assert!(device.calls().is_empty());
    }
}
