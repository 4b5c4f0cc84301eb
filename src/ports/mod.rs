pub mod config_port;
pub mod market_data_port;
pub mod sandbox_port;
pub mod text_generation_port;
