//! Submit CWL workflows to a Seven Bridges platform and collect their outputs.
//!
//! [`pipeline::run`] chains the pieces: the workflow is loaded with every
//! `run` reference inlined, published as a content-addressed app, its job
//! files are uploaded (or reused by name), the task is polled to a terminal
//! state and the output files are downloaded into the output directory.
#![forbid(unsafe_code)]

pub mod canonical;
pub mod clock;
pub mod document;
pub mod error;
pub mod hasher;
pub mod job;
pub mod loader;
pub mod outputs;
pub mod path_safety;
pub mod pipeline;
pub mod platform;
pub mod publish;
pub mod task;

pub use error::{PlatformError, Result, RunnerError};
pub use pipeline::{PreparedRun, RunConfig, Verbosity, run};
