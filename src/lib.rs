//! Workspace-based API testing: folders and files holding API definitions
//! and test cases, environments with `{{variable}}` resolution, direct
//! execution with inherited folder headers, and bulk or scheduled runs.

pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod import_export;
pub mod logging;
pub mod remote;
pub mod session;
pub mod store;

pub use error::{Error, Result};
