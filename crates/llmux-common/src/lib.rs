pub mod config;
pub mod families;
pub mod service;

pub use config::{ConfigError, GlobalConfig, ServiceKeys};
pub use families::{
    ModelFamily, context_window_for, default_family, normalize_model, resolve_family,
    service_families,
};
pub use service::{Dialect, Service};
