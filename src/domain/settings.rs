//! Application settings read from the INI settings file.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::autofix::DEFAULT_MAX_ATTEMPTS;
use crate::domain::config_validation::validate_settings;
use crate::domain::error::StratforgeError;
use crate::domain::execution::ExecutionConfig;
use crate::domain::pipeline::PipelineOptions;
use crate::ports::config_port::ConfigPort;
use crate::ports::sandbox_port::SandboxLimits;

pub const DEFAULT_LLM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_LLM_MODEL: &str = "anthropic/claude-3.5-sonnet";
pub const DEFAULT_API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const DEFAULT_YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f64,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProvider {
    Yahoo,
    Csv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSettings {
    pub provider: DataProvider,
    pub csv_dir: Option<PathBuf>,
    /// Fetched series are kept here as CSV when set.
    pub cache_dir: Option<PathBuf>,
    pub yahoo_base_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    /// Worker executable; the running binary when unset.
    pub program: Option<PathBuf>,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub llm: LlmSettings,
    pub data: DataSettings,
    pub sandbox: SandboxSettings,
    pub max_repair_attempts: usize,
    pub execution: ExecutionConfig,
    pub risk_free_rate: f64,
}

impl Default for Settings {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Settings {
            llm: LlmSettings {
                base_url: DEFAULT_LLM_BASE_URL.to_string(),
                model: DEFAULT_LLM_MODEL.to_string(),
                api_key_env: DEFAULT_API_KEY_ENV.to_string(),
                temperature: 0.1,
                timeout: Duration::from_secs(60),
            },
            data: DataSettings {
                provider: DataProvider::Yahoo,
                csv_dir: None,
                cache_dir: None,
                yahoo_base_url: DEFAULT_YAHOO_BASE_URL.to_string(),
            },
            sandbox: SandboxSettings {
                program: None,
                limits,
            },
            max_repair_attempts: DEFAULT_MAX_ATTEMPTS,
            execution: ExecutionConfig::default(),
            risk_free_rate: 0.0,
        }
    }
}

fn seconds(value: i64) -> Duration {
    Duration::from_secs(value.max(1) as u64)
}

impl Settings {
    /// Validate `config` and read it over the defaults.
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, StratforgeError> {
        validate_settings(config)?;
        let defaults = Settings::default();

        let llm = LlmSettings {
            base_url: config
                .get_string("llm", "base_url")
                .unwrap_or(defaults.llm.base_url),
            model: config.get_string("llm", "model").unwrap_or(defaults.llm.model),
            api_key_env: config
                .get_string("llm", "api_key_env")
                .unwrap_or(defaults.llm.api_key_env),
            temperature: config.get_double("llm", "temperature", defaults.llm.temperature),
            timeout: seconds(config.get_int(
                "llm",
                "timeout_secs",
                defaults.llm.timeout.as_secs() as i64,
            )),
        };

        let provider = match config.get_string("data", "provider").as_deref() {
            Some("csv") => DataProvider::Csv,
            _ => DataProvider::Yahoo,
        };
        let data = DataSettings {
            provider,
            csv_dir: config.get_string("data", "csv_dir").map(PathBuf::from),
            cache_dir: config.get_string("data", "cache_dir").map(PathBuf::from),
            yahoo_base_url: config
                .get_string("data", "yahoo_base_url")
                .unwrap_or(defaults.data.yahoo_base_url),
        };

        let timeout_secs = config.get_int(
            "sandbox",
            "timeout_secs",
            defaults.sandbox.limits.timeout.as_secs() as i64,
        );
        let limits = SandboxLimits {
            timeout: seconds(timeout_secs),
            max_memory_mb: config.get_int(
                "sandbox",
                "max_memory_mb",
                defaults.sandbox.limits.max_memory_mb as i64,
            ) as u64,
            // The CPU backstop trails the wall clock so timeouts stay timeouts.
            cpu_seconds: config.get_int("sandbox", "cpu_seconds", timeout_secs.max(1) + 1) as u64,
            isolate_network: config.get_bool(
                "sandbox",
                "isolate_network",
                defaults.sandbox.limits.isolate_network,
            ),
        };
        let sandbox = SandboxSettings {
            program: config.get_string("sandbox", "program").map(PathBuf::from),
            limits,
        };

        let base = &defaults.execution;
        let execution = ExecutionConfig {
            commission_per_trade: config.get_double(
                "backtest",
                "commission_per_trade",
                base.commission_per_trade,
            ),
            commission_pct: config.get_double("backtest", "commission_pct", base.commission_pct),
            slippage_pct: config.get_double("backtest", "slippage_pct", base.slippage_pct),
            allow_shorting: config.get_bool("backtest", "allow_shorting", base.allow_shorting),
            fractional_units: config.get_bool(
                "backtest",
                "fractional_units",
                base.fractional_units,
            ),
        };

        Ok(Settings {
            llm,
            data,
            sandbox,
            max_repair_attempts: config.get_int(
                "pipeline",
                "max_repair_attempts",
                defaults.max_repair_attempts as i64,
            ) as usize,
            execution,
            risk_free_rate: config.get_double("backtest", "risk_free_rate", defaults.risk_free_rate),
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_repair_attempts: self.max_repair_attempts,
            limits: self.sandbox.limits.clone(),
            risk_free_rate: self.risk_free_rate,
        }
    }
}
