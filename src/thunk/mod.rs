pub mod config;
pub mod context;
pub mod fork;
pub mod memory;
pub mod topology;
