pub mod cache;
pub mod config;
pub mod kafka;
pub mod metrics;
pub mod person;
pub mod reader;
pub mod service;
pub mod signal;
pub mod store;
pub mod test_utils;
