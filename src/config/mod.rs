//! Configuration types and loading for flowctl

mod loader;

pub use loader::{
    ControllerSettings, CronSettings, Defaults, EngineConfig, RetrySettings, StoreSettings,
};
