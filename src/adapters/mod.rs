//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod disk_cache;
pub mod file_config_adapter;
pub mod openai_adapter;
pub mod process_sandbox;
pub mod yahoo_adapter;
