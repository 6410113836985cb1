//! nodefleet-core: shared building blocks for the nodefleet autoscaler.
//!
//! - **`config`**: `fleet.toml` parsing and validation
//! - **`clock`**: wall-clock abstraction (system and manual clocks)
//! - **`duration`**: human-readable durations ("30s", "5m", "7d")
//! - **`http`**: minimal JSON-over-HTTP/1 client used by the adapters

pub mod clock;
pub mod config;
pub mod duration;
pub mod http;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{
    CapacityConfig, ClusterConfig, ConfigError, CooldownConfig, FleetConfig, LifecycleConfig,
    LockConfig, MetricsConfig, PredictiveConfig, ThresholdConfig,
};
pub use duration::{HumanDuration, parse_duration};
pub use http::HttpError;
