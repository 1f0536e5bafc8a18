//! # sluice-pipeline
//!
//! The façade the orchestration loop calls for every tool.
//!
//! This crate provides:
//! - [`ToolInvocationPipeline`]: input resolution, workspace, execution and
//!   artifact registration in one call that never raises
//! - The [`Tool`] contract for business-logic bodies
//! - Per-workspace activity logging
//! - Built-in `summarize` and `insight` tools

mod activity_logger;
pub mod builtin;
mod pipeline;
mod result;
mod tool;

pub use activity_logger::{ActivityEntry, ActivityLogger};
pub use builtin::{InsightTool, SummarizeTool};
pub use pipeline::{ToolInvocationPipeline, UPLOAD_SOURCE};
pub use result::{FailureStage, ToolFailure, ToolResult, ToolSuccess};
pub use tool::{FileParam, ProducedFile, Tool, ToolContext, ToolOutput};
