//! Controller configuration. The controller persists no state (§6.4); this
//! is the only tunable surface, following the original's named constants.

use std::time::Duration;

/// Hard cap on direct Bluetooth connections: BT piconets cannot exceed
/// seven direct radio links.
pub const ABSOLUTE_MAX_CONNECTIONS: u8 = 7;

/// Default cap on direct connections, leaving headroom for a car-kit or
/// headset that isn't part of the piconet.
pub const DEFAULT_MAX_CONNECTIONS: u8 = 6;

/// Nominal found-cache entry lifetime.
pub const LOST_DEVICE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Extra grace added to the found-cache alarm so nearby expirations batch
/// into a single wakeup.
pub const LOST_DEVICE_TIMEOUT_EXT: Duration = Duration::from_millis(5_000);

/// Default delegation rotation interval.
pub const DELEGATION_ROTATION: Duration = Duration::from_millis(30_000);

/// Default deadline for the synchronous SetState method call.
pub const SET_STATE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Controller configuration, clamped and defaulted per §6.3.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum number of direct minions, clamped to
    /// `1..=ABSOLUTE_MAX_CONNECTIONS`.
    pub max_connections: u8,
    /// How long a found-cache entry may go unrefreshed before it expires.
    pub lost_device_timeout: Duration,
    /// Grace period batched onto the found-cache expiry alarm.
    pub lost_device_grace: Duration,
    /// How often the master reissues delegation to the next direct minion.
    pub delegation_rotation: Duration,
    /// Deadline for the synchronous SetState method call.
    pub set_state_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lost_device_timeout: LOST_DEVICE_TIMEOUT,
            lost_device_grace: LOST_DEVICE_TIMEOUT_EXT,
            delegation_rotation: DELEGATION_ROTATION,
            set_state_timeout: SET_STATE_TIMEOUT,
        }
    }
}

impl Config {
    /// Builds a config, clamping `max_connections` into the valid range.
    pub fn new(max_connections: u8) -> Self {
        Self { max_connections: max_connections.clamp(1, ABSOLUTE_MAX_CONNECTIONS), ..Self::default() }
    }
}
