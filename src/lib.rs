//! flowctl - a DAG workflow engine
//!
//! Workflow templates are resolved into concrete instances, driven node by
//! node to a terminal phase by the [`engine::WorkflowController`], fired on a
//! schedule by the [`cron::CronScheduler`], and kept as immutable snapshots
//! in the archive once finished.

pub mod cli;
pub mod clock;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod resolver;
pub mod retry;
pub mod signals;
pub mod store;
pub mod worker;

pub use error::EngineError;
