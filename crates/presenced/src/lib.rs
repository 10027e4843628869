//! Attendance daemon internals: configuration and the capture loop.
//!
//! The binary wires [`config::Config`] to the capture threads in
//! [`capture`]; the CLI reuses the same configuration.

pub mod capture;
pub mod config;

pub use capture::{
    run_source, spawn_sources, CaptureError, CaptureHandle, FramePipeline, FrameStats,
    SourceReport, SourceState, SourceTask,
};
pub use config::{Config, ConfigError};
