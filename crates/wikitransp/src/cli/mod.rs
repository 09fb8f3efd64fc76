//! Command handlers.

pub mod bans;
pub mod config;
pub mod scan;
