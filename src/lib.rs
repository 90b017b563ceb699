#![forbid(unsafe_code)]

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod session;
pub mod turn;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
