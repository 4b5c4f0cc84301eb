//! Core domain types and logic: the strategy pipeline, the DSL and its
//! compiler, and the backtest engine the sandbox worker runs.

pub mod ohlcv;
pub mod request;
pub mod error;
pub mod dialect;
pub mod content_hash;
pub mod dsl;
pub mod validator;
pub mod compiler;
pub mod translator;
pub mod autofix;
pub mod pipeline;
pub mod market_data_cache;
pub mod optimization;
pub mod settings;
pub mod config_validation;
pub mod program;
pub mod position;
pub mod portfolio;
pub mod execution;
pub mod execution_result;
pub mod indicator;
pub mod rule;
pub mod rule_parser;
pub mod rule_eval;
pub mod engine;
pub mod metrics;
