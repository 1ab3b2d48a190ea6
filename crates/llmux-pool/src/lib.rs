pub mod events;
pub mod pool;
pub mod recheck;
pub mod record;

pub use events::{EventHub, PoolEvent, PoolEventSink, TracingEventSink};
pub use pool::{
    FamilyStats, KEY_REUSE_DELAY, KeyPool, LockoutPeriod, NoKeysAvailable, PoolConfig,
    RATE_LIMIT_LOCKOUT,
};
pub use recheck::spawn_recheckers;
pub use record::{
    AwsLoggingStatus, DisableReason, FamilyUsage, KeyHash, KeyPatch, KeyRecord, ServiceKeyExtra,
    hash_secret,
};
