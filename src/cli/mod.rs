//! CLI module for flowctl
//!
//! This module provides:
//! - Command implementations (submit, list, template, cron, archive, controller)
//! - Output handlers (console, JSON, quiet)
//!
//! # Example
//!
//! ```ignore
//! use flowctl::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console);
//! let engine = commands::Engine::open(&config, &dir)?;
//! let exit_code = commands::list_workflows(&engine, None, &*handler).await?;
//! ```

pub mod commands;
pub mod output;

pub use commands::{ArchiveListArgs, Engine, SourceRef, SubmitArgs, parse_source};
pub use output::{OutputHandler, OutputMode, create_handler};
