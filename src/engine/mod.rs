//! Workflow execution engine
//!
//! [`machine`] holds the pure node state machine; [`WorkflowController`]
//! persists instances, dispatches nodes to a worker provider and feeds
//! worker reports back through the state machine.

mod controller;
pub mod machine;

pub use controller::WorkflowController;
pub use machine::Transition;
