pub mod config;
pub mod redis;
pub mod signing;
pub mod types;
