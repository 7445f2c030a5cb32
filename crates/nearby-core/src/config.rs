//! Centralized Configuration Management
//!
//! All engine tunables live here so the CLI (or a host application) can load
//! them from one TOML document. Durations are stored as milliseconds.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Role Scheduler Configuration
// ----------------------------------------------------------------------------

/// Duty-cycle configuration for the advertise/scan alternation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Length of an advertise-only window
    pub advertise_window_ms: u64,
    /// Length of a scan burst
    pub scan_window_ms: u64,
    /// Rotate the local identity token this often (disabled when unset)
    pub identity_rotation_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            advertise_window_ms: 4_000,
            scan_window_ms: 1_000,
            identity_rotation_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn advertise_window(&self) -> Duration {
        Duration::from_millis(self.advertise_window_ms)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn identity_rotation(&self) -> Option<Duration> {
        self.identity_rotation_ms.map(Duration::from_millis)
    }

    /// Duration of one full advertise + scan cycle
    pub fn duty_cycle(&self) -> Duration {
        self.advertise_window() + self.scan_window()
    }
}

// ----------------------------------------------------------------------------
// Peer Registry Configuration
// ----------------------------------------------------------------------------

/// Liveness and reconciliation settings for the peer registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Records older than this are evicted by the sweep
    pub peer_ttl_ms: u64,
    /// How often the sweep runs
    pub sweep_interval_ms: u64,
    /// Link rotated tokens to existing records
    pub link_rotations: bool,
    /// A rotated token may link to a record seen at most this long ago
    pub link_window_ms: u64,
    /// Maximum signal difference (dB) for a rotation link
    pub link_rssi_tolerance: f32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer_ttl_ms: 30_000,
            sweep_interval_ms: 5_000,
            link_rotations: true,
            link_window_ms: 5_000,
            link_rssi_tolerance: 10.0,
        }
    }
}

impl RegistryConfig {
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Promotion and session lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum smoothed signal (dBm) for promotion into a session
    pub promotion_rssi_threshold: i16,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Delay before a peer whose handshake failed may be promoted again
    pub handshake_cooldown_ms: u64,
    /// Bound on waiting for sessions to close during shutdown
    pub close_timeout_ms: u64,
    pub max_sessions: usize,
    /// Outbound message queue depth per session
    pub outbound_queue: usize,
    pub max_payload_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            promotion_rssi_threshold: -75,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            handshake_cooldown_ms: 15_000,
            close_timeout_ms: 1_000,
            max_sessions: 8,
            outbound_queue: 32,
            max_payload_size: 512,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_cooldown(&self) -> Duration {
        Duration::from_millis(self.handshake_cooldown_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Dispatch Configuration
// ----------------------------------------------------------------------------

/// Event dispatcher queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Soft bound per delegate queue; only coalescible events are evicted
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Longer advertise windows and rarer sweeps for backgrounded operation
    pub fn low_power() -> Self {
        Self {
            scheduler: SchedulerConfig {
                advertise_window_ms: 10_000,
                scan_window_ms: 1_000,
                identity_rotation_ms: Some(15 * 60 * 1_000),
            },
            registry: RegistryConfig {
                peer_ttl_ms: 60_000,
                sweep_interval_ms: 10_000,
                ..RegistryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Short timers for tests
    pub fn testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                advertise_window_ms: 400,
                scan_window_ms: 100,
                identity_rotation_ms: None,
            },
            registry: RegistryConfig {
                peer_ttl_ms: 3_000,
                sweep_interval_ms: 500,
                ..RegistryConfig::default()
            },
            session: SessionConfig {
                connect_timeout_ms: 500,
                handshake_timeout_ms: 500,
                handshake_cooldown_ms: 2_000,
                close_timeout_ms: 200,
                ..SessionConfig::default()
            },
            dispatch: DispatchConfig::default(),
        }
    }

    /// Set the duty-cycle windows
    pub fn with_duty_cycle(mut self, advertise: Duration, scan: Duration) -> Self {
        self.scheduler.advertise_window_ms = advertise.as_millis() as u64;
        self.scheduler.scan_window_ms = scan.as_millis() as u64;
        self
    }

    /// Set the peer liveness TTL
    pub fn with_peer_ttl(mut self, ttl: Duration) -> Self {
        self.registry.peer_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set how often expired peers are evicted
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.registry.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the promotion threshold
    pub fn with_promotion_threshold(mut self, rssi: i16) -> Self {
        self.session.promotion_rssi_threshold = rssi;
        self
    }

    /// Enable periodic identity rotation
    pub fn with_identity_rotation(mut self, interval: Duration) -> Self {
        self.scheduler.identity_rotation_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        positive("scheduler.advertise_window_ms", self.scheduler.advertise_window_ms)?;
        positive("scheduler.scan_window_ms", self.scheduler.scan_window_ms)?;
        if let Some(rotation) = self.scheduler.identity_rotation_ms {
            positive("scheduler.identity_rotation_ms", rotation)?;
        }
        positive("registry.peer_ttl_ms", self.registry.peer_ttl_ms)?;
        positive("registry.sweep_interval_ms", self.registry.sweep_interval_ms)?;
        positive("session.connect_timeout_ms", self.session.connect_timeout_ms)?;
        positive("session.handshake_timeout_ms", self.session.handshake_timeout_ms)?;
        positive("session.outbound_queue", self.session.outbound_queue as u64)?;
        positive("session.max_payload_size", self.session.max_payload_size as u64)?;
        positive("dispatch.queue_capacity", self.dispatch.queue_capacity as u64)?;

        if self.registry.peer_ttl_ms < self.scheduler.duty_cycle().as_millis() as u64 {
            return Err(ConfigError::InvalidValue {
                field: "registry.peer_ttl_ms",
                reason: "must cover at least one duty cycle".into(),
            });
        }
        let tolerance = self.registry.link_rssi_tolerance;
        if tolerance.is_nan() || tolerance < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "registry.link_rssi_tolerance",
                reason: "must be a non-negative number".into(),
            });
        }
        Ok(())
    }
}
