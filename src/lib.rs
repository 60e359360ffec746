//! Admin Tasks — background task execution with live progress streaming.

pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod executor;
pub mod tasks;
