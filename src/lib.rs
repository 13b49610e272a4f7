pub mod agent;
pub mod collector;
pub mod config;
pub mod export;
pub mod host;
pub mod metadata;
pub mod point;
pub mod scheduler;
pub mod sink;
pub mod watchdog;
