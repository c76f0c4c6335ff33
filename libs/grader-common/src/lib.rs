pub mod config;
pub mod policy;
pub mod redis;
pub mod store;
pub mod types;
