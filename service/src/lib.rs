//! Host infrastructure for the Cloudron login: settings and logging.

pub mod config;
pub mod logging;
