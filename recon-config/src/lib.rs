//! Configuration for ReconWhisper.
//!
//! Resolves the orchestrator and adapter settings from the environment, a
//! config file or built-in defaults, then runs the guard rails that reject
//! unsafe values before the runtime is built.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoad, ConfigSources};
pub use models::{
    AdapterSettings, DnsSettings, ReconConfig, ReconConfigSource, TcpConnectSettings,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
