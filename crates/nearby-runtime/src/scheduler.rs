//! Role scheduler
//!
//! Alternates the radio between advertise-only windows and short scan bursts.
//! The scheduler owns the [`Radio`] for the lifetime of the engine: it acquires
//! it on `start`, releases it on `stop` or when the radio becomes unavailable,
//! and is the only component that issues radio operations.
//!
//! The scheduler never sleeps on its own. The engine worker asks for
//! [`RoleScheduler::next_deadline`] and calls [`RoleScheduler::on_timer`] when
//! it passes.

use std::collections::VecDeque;
use std::sync::Arc;

use nearby_core::protocol::{decode, encode, AdvertisementPayload};
use nearby_core::{
    Connector, IdentityToken, PeerIdentity, PeerSighting, Radio, RadioError, RadioEvent,
    RadioState, RawAdvertisement, SchedulerConfig, Timestamp,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Own tokens remembered for filtering our own advertisements
const OWN_TOKEN_HISTORY: usize = 2;

// ----------------------------------------------------------------------------
// Scheduler State
// ----------------------------------------------------------------------------

/// Radio role active in a running window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Advertising,
    Scanning,
}

/// What to pick up again after a suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeState {
    pub role: Role,
    /// Time that was left in the interrupted window
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Advertising { deadline: Timestamp },
    Scanning { deadline: Timestamp },
    Suspended(ResumeState),
    /// Radio unavailable; timers are ignored until `restart`
    Halted,
}

impl SchedulerState {
    /// Availability as reported to delegates
    pub fn radio_state(&self) -> RadioState {
        match self {
            SchedulerState::Advertising { .. } | SchedulerState::Scanning { .. } => {
                RadioState::Running
            }
            SchedulerState::Suspended(_) => RadioState::Suspended,
            SchedulerState::Halted => RadioState::Unavailable,
            SchedulerState::Idle => RadioState::Stopped,
        }
    }
}

/// Result of a timer tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleTransition {
    /// Deadline not reached or nothing running
    None,
    /// Advertise window ended, scan burst started
    ScanStarted,
    /// Scan burst ended, advertising again
    ScanEnded,
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scan_windows: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub own_filtered: u64,
}

// ----------------------------------------------------------------------------
// Role Scheduler
// ----------------------------------------------------------------------------

pub struct RoleScheduler {
    radio: Box<dyn Radio>,
    config: SchedulerConfig,
    state: SchedulerState,
    payload: AdvertisementPayload,
    own_tokens: VecDeque<IdentityToken>,
    acquired: bool,
    stats: SchedulerStats,
}

impl RoleScheduler {
    pub fn new(radio: Box<dyn Radio>, config: SchedulerConfig, identity: &PeerIdentity) -> Self {
        let mut own_tokens = VecDeque::with_capacity(OWN_TOKEN_HISTORY);
        own_tokens.push_back(identity.token());
        Self {
            radio,
            config,
            state: SchedulerState::Idle,
            payload: encode(identity),
            own_tokens,
            acquired: false,
            stats: SchedulerStats::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Whether the radio is currently cycling
    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            SchedulerState::Advertising { .. } | SchedulerState::Scanning { .. }
        )
    }

    /// Take the radio event stream (once)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<RadioEvent>> {
        self.radio.take_events()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.radio.connector()
    }

    /// Deadline of the current window, if a window is running
    pub fn next_deadline(&self) -> Option<Timestamp> {
        match self.state {
            SchedulerState::Advertising { deadline } | SchedulerState::Scanning { deadline } => {
                Some(deadline)
            }
            _ => None,
        }
    }

    /// Acquire the radio and open the first advertise window
    pub async fn start(&mut self, now: Timestamp) -> Result<(), RadioError> {
        if !matches!(self.state, SchedulerState::Idle | SchedulerState::Halted) {
            return Ok(());
        }

        if let Err(err) = self.radio.acquire().await {
            warn!("Failed to acquire radio: {}", err);
            self.state = SchedulerState::Halted;
            return Err(err);
        }
        self.acquired = true;

        let result = self.radio.start_advertising(&self.payload).await;
        self.check("start advertising", result).await?;
        self.state = SchedulerState::Advertising {
            deadline: now.after(self.config.advertise_window()),
        };
        info!(
            "Role scheduler started ({}ms advertise / {}ms scan)",
            self.config.advertise_window_ms, self.config.scan_window_ms
        );
        Ok(())
    }

    /// Advance the duty cycle if the current deadline has passed
    pub async fn on_timer(&mut self, now: Timestamp) -> Result<RoleTransition, RadioError> {
        match self.state {
            SchedulerState::Advertising { deadline } if deadline <= now => {
                let result = self.radio.stop_advertising().await;
                self.check("stop advertising", result).await?;
                let result = self.radio.start_scan().await;
                self.check("start scan", result).await?;

                self.state = SchedulerState::Scanning {
                    deadline: now.after(self.config.scan_window()),
                };
                trace!("Scan window opened");
                Ok(RoleTransition::ScanStarted)
            }
            SchedulerState::Scanning { deadline } if deadline <= now => {
                let result = self.radio.stop_scan().await;
                self.check("stop scan", result).await?;
                let result = self.radio.start_advertising(&self.payload).await;
                self.check("start advertising", result).await?;

                self.stats.scan_windows += 1;
                self.state = SchedulerState::Advertising {
                    deadline: now.after(self.config.advertise_window()),
                };
                trace!("Scan window closed");
                Ok(RoleTransition::ScanEnded)
            }
            _ => Ok(RoleTransition::None),
        }
    }

    /// Quiesce the radio, remembering where the cycle stood
    pub async fn suspend(&mut self, now: Timestamp) -> Result<(), RadioError> {
        let (role, deadline) = match self.state {
            SchedulerState::Advertising { deadline } => (Role::Advertising, deadline),
            SchedulerState::Scanning { deadline } => (Role::Scanning, deadline),
            _ => return Ok(()),
        };

        let result = match role {
            Role::Advertising => self.radio.stop_advertising().await,
            Role::Scanning => self.radio.stop_scan().await,
        };
        self.check("suspend", result).await?;

        let resume = ResumeState {
            role,
            remaining_ms: deadline - now,
        };
        debug!("Role scheduler suspended ({:?})", resume);
        self.state = SchedulerState::Suspended(resume);
        Ok(())
    }

    /// Resume advertising after a suspension
    ///
    /// An interrupted advertise window gets its remaining time back; an
    /// interrupted scan burst is abandoned for a fresh advertise window.
    pub async fn resume(&mut self, now: Timestamp) -> Result<(), RadioError> {
        let SchedulerState::Suspended(resume) = self.state else {
            return Ok(());
        };

        let result = self.radio.start_advertising(&self.payload).await;
        self.check("resume advertising", result).await?;

        let deadline = match resume.role {
            Role::Advertising => now + resume.remaining_ms,
            Role::Scanning => now.after(self.config.advertise_window()),
        };
        debug!("Role scheduler resumed");
        self.state = SchedulerState::Advertising { deadline };
        Ok(())
    }

    /// Stop whatever is running and start over from a fresh advertise window
    pub async fn restart(&mut self, now: Timestamp) -> Result<(), RadioError> {
        self.stop().await;
        self.start(now).await
    }

    /// Stop advertising and scanning and release the radio
    pub async fn stop(&mut self) {
        match self.state {
            SchedulerState::Advertising { .. } => {
                if let Err(err) = self.radio.stop_advertising().await {
                    debug!("Stop advertising during shutdown failed: {}", err);
                }
            }
            SchedulerState::Scanning { .. } => {
                if let Err(err) = self.radio.stop_scan().await {
                    debug!("Stop scan during shutdown failed: {}", err);
                }
            }
            _ => {}
        }
        self.release().await;
        self.state = SchedulerState::Idle;
    }

    /// Advertise a new local identity from now on
    pub async fn update_identity(&mut self, identity: &PeerIdentity) -> Result<(), RadioError> {
        self.payload = encode(identity);
        let token = identity.token();
        if !self.own_tokens.contains(&token) {
            if self.own_tokens.len() == OWN_TOKEN_HISTORY {
                self.own_tokens.pop_front();
            }
            self.own_tokens.push_back(token);
        }

        if matches!(self.state, SchedulerState::Advertising { .. }) {
            let result = self.radio.start_advertising(&self.payload).await;
            self.check("re-advertise", result).await?;
        }
        Ok(())
    }

    /// Turn raw advertisement data into a sighting
    ///
    /// Decode failures are counted and skipped; our own advertisements are
    /// filtered out.
    pub fn decode(&mut self, raw: &RawAdvertisement, now: Timestamp) -> Option<PeerSighting> {
        let identity = match decode(&raw.data) {
            Ok(identity) => identity,
            Err(err) => {
                self.stats.decode_failures += 1;
                debug!("Skipping advertisement from {}: {}", raw.device, err);
                return None;
            }
        };

        if self.own_tokens.contains(&identity.token()) {
            self.stats.own_filtered += 1;
            return None;
        }

        self.stats.decoded += 1;
        Some(PeerSighting {
            identity,
            device: raw.device.clone(),
            rssi: raw.rssi,
            timestamp: now,
        })
    }

    /// Fatal errors halt the scheduler; transient ones are logged and ignored
    async fn check(&mut self, operation: &str, result: Result<(), RadioError>) -> Result<(), RadioError> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => {
                warn!("Radio unavailable during {}: {}", operation, err);
                self.halt().await;
                Err(err)
            }
            Err(err) => {
                warn!("Radio operation {} failed: {}", operation, err);
                Ok(())
            }
        }
    }

    /// Enter `Halted` after the radio reported itself unavailable
    pub async fn halt(&mut self) {
        self.release().await;
        self.state = SchedulerState::Halted;
    }

    async fn release(&mut self) {
        if self.acquired {
            self.radio.release().await;
            self.acquired = false;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::{DeviceHandle, RadioError};
    use nearby_harness::{MockRadio, MockRadioController, RadioOp};

    fn local() -> PeerIdentity {
        PeerIdentity::new(IdentityToken::new([1; 6]), "me", None)
    }

    fn scheduler() -> (RoleScheduler, MockRadioController) {
        let (radio, controller) = MockRadio::new();
        let config = SchedulerConfig {
            advertise_window_ms: 4_000,
            scan_window_ms: 1_000,
            identity_rotation_ms: None,
        };
        (RoleScheduler::new(Box::new(radio), config, &local()), controller)
    }

    fn t(ms: u64) -> Timestamp {
        Timestamp::new(ms)
    }

    #[tokio::test]
    async fn test_duty_cycle_alternates_roles() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();
        assert_eq!(scheduler.next_deadline(), Some(t(4_000)));
        assert_eq!(controller.advertised_payload(), Some(encode(&local()).to_vec()));

        assert_eq!(scheduler.on_timer(t(3_999)).await.unwrap(), RoleTransition::None);
        assert_eq!(scheduler.on_timer(t(4_000)).await.unwrap(), RoleTransition::ScanStarted);
        assert!(controller.is_scanning());
        assert_eq!(controller.advertised_payload(), None);
        assert_eq!(scheduler.next_deadline(), Some(t(5_000)));

        assert_eq!(scheduler.on_timer(t(5_000)).await.unwrap(), RoleTransition::ScanEnded);
        assert!(!controller.is_scanning());
        assert!(controller.advertised_payload().is_some());
        assert_eq!(scheduler.stats().scan_windows, 1);

        assert_eq!(
            controller.ops(),
            vec![
                RadioOp::Acquire,
                RadioOp::StartAdvertising(encode(&local()).to_vec()),
                RadioOp::StopAdvertising,
                RadioOp::StartScan,
                RadioOp::StopScan,
                RadioOp::StartAdvertising(encode(&local()).to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_suspend_and_resume_honours_remaining_window() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();

        scheduler.suspend(t(1_500)).await.unwrap();
        assert_eq!(
            scheduler.state(),
            SchedulerState::Suspended(ResumeState {
                role: Role::Advertising,
                remaining_ms: 2_500
            })
        );
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(controller.advertised_payload(), None);

        // Timers are ignored while suspended
        assert_eq!(scheduler.on_timer(t(9_000)).await.unwrap(), RoleTransition::None);

        scheduler.resume(t(10_000)).await.unwrap();
        assert_eq!(scheduler.next_deadline(), Some(t(12_500)));
        assert!(controller.advertised_payload().is_some());
    }

    #[tokio::test]
    async fn test_resume_after_scan_starts_fresh_window() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();
        scheduler.on_timer(t(4_000)).await.unwrap();

        scheduler.suspend(t(4_200)).await.unwrap();
        assert!(!controller.is_scanning());
        scheduler.resume(t(6_000)).await.unwrap();
        assert_eq!(scheduler.next_deadline(), Some(t(10_000)));
    }

    #[tokio::test]
    async fn test_unavailable_radio_halts_until_restart() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();

        controller.set_unavailable(true);
        let err = scheduler.on_timer(t(4_000)).await.unwrap_err();
        assert!(matches!(err, RadioError::Unavailable(_)));
        assert_eq!(scheduler.state(), SchedulerState::Halted);
        assert_eq!(scheduler.state().radio_state(), RadioState::Unavailable);
        assert!(!controller.is_acquired());
        assert_eq!(scheduler.on_timer(t(20_000)).await.unwrap(), RoleTransition::None);

        // Still unavailable: restart fails and stays halted
        assert!(scheduler.restart(t(21_000)).await.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Halted);

        controller.set_unavailable(false);
        scheduler.restart(t(22_000)).await.unwrap();
        assert_eq!(scheduler.next_deadline(), Some(t(26_000)));
        assert!(controller.is_acquired());
    }

    #[tokio::test]
    async fn test_stop_releases_radio() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();
        scheduler.on_timer(t(4_000)).await.unwrap();
        scheduler.stop().await;

        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!controller.is_acquired());
        assert!(!controller.is_scanning());
        let ops = controller.ops();
        assert_eq!(&ops[ops.len() - 2..], &[RadioOp::StopScan, RadioOp::Release]);
    }

    #[tokio::test]
    async fn test_decode_counts_failures_and_filters_self() {
        let (mut scheduler, _controller) = scheduler();
        let device = DeviceHandle::new("aa:bb");
        let peer = PeerIdentity::new(IdentityToken::new([2; 6]), "peer", None);

        let sighting = scheduler
            .decode(
                &RawAdvertisement {
                    device: device.clone(),
                    data: encode(&peer).to_vec(),
                    rssi: -50,
                },
                t(10),
            )
            .unwrap();
        assert_eq!(sighting.identity, peer);
        assert_eq!(sighting.timestamp, t(10));

        let garbage = RawAdvertisement {
            device: device.clone(),
            data: vec![0xff; 3],
            rssi: -50,
        };
        assert!(scheduler.decode(&garbage, t(11)).is_none());

        let own = RawAdvertisement {
            device,
            data: encode(&local()).to_vec(),
            rssi: -30,
        };
        assert!(scheduler.decode(&own, t(12)).is_none());

        let stats = scheduler.stats();
        assert_eq!((stats.decoded, stats.decode_failures, stats.own_filtered), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_update_identity_readvertises() {
        let (mut scheduler, controller) = scheduler();
        scheduler.start(t(0)).await.unwrap();

        let rotated = local().rotated(IdentityToken::new([7; 6]));
        scheduler.update_identity(&rotated).await.unwrap();
        assert_eq!(controller.advertised_payload(), Some(encode(&rotated).to_vec()));

        // The previous token is still recognised as our own
        let old = RawAdvertisement {
            device: DeviceHandle::new("self"),
            data: encode(&local()).to_vec(),
            rssi: -30,
        };
        assert!(scheduler.decode(&old, t(1)).is_none());
    }
}
