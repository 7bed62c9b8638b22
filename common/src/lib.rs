// Common library for the Redis connection manager

pub mod clock;
pub mod config;
pub mod connection;
pub mod errors;
pub mod models;
pub mod profile;
pub mod telemetry;
