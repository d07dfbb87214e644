//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod distributed;
mod identity;
mod key;
mod limiter;
mod rules;

pub use backend::{CountingBackend, WindowTally};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{FixedWindowCounter, DEFAULT_SWEEP_INTERVAL};
pub use distributed::{RedisStoreConfig, RedisWindowStore, DEFAULT_KEY_PREFIX};
pub use identity::{Identity, IdentityResolver, RequestHeaders, UNKNOWN_IP};
pub use key::{PartitionKey, KEY_DELIMITER};
pub use limiter::{
    check_rate_limit, Backends, CountSource, Decision, RateLimiter, DEFAULT_STORE_TIMEOUT,
};
pub use rules::{PartitionBy, Preset, PresetLimit, PresetSettings, RuleConfig, MAX_WINDOW_SECS};
