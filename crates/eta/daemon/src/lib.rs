//! ETA Daemon library
//!
//! This module provides the core components for the ETA daemon:
//! - REST API handlers for ride submissions, predictions and health
//! - Layered configuration (defaults, file, environment)
//! - Storage selection and reference seeding
//! - Server lifecycle management

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
