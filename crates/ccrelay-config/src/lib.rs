//! Configuration loading for ccrelay
//!
//! This crate reads the profile list and system settings consumed by the
//! proxy. It never writes the settings file; editing profiles is the job of
//! the settings front-ends.

pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, find_config_file, load_config, load_config_from_file, state_dir,
};
pub use schema::{
    CcrelayConfig, FailedEndpointSettings, HealthCheckSettings, ParseStrategyError,
    ProfileConfig, ProxySettings, SpeedFirstSettings, SpeedTestStrategy, Strategy,
    SystemSettings, AUTO_TRANSFORMER,
};
