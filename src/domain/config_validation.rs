//! Settings file validation.
//!
//! Every key is optional. Present keys are range-checked here before
//! [`Settings::from_config`](crate::domain::settings::Settings::from_config)
//! reads them, so a typo fails loudly instead of silently taking a default.

use crate::domain::error::StratforgeError;
use crate::ports::config_port::ConfigPort;

pub fn validate_settings(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    validate_llm(config)?;
    validate_data(config)?;
    validate_sandbox(config)?;
    validate_pipeline(config)?;
    validate_backtest(config)?;
    Ok(())
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> StratforgeError {
    StratforgeError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Parse a present value, failing instead of falling back to the default.
fn parsed<T: std::str::FromStr>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    expected: &str,
) -> Result<Option<T>, StratforgeError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(section, key, format!("'{raw}' is not {expected}"))),
    }
}

fn validate_url(config: &dyn ConfigPort, section: &str, key: &str) -> Result<(), StratforgeError> {
    if let Some(url) = config.get_string(section, key) {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(section, key, format!("{key} must be an http(s) URL")));
        }
    }
    Ok(())
}

fn validate_llm(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    validate_url(config, "llm", "base_url")?;

    if let Some(temperature) = parsed::<f64>(config, "llm", "temperature", "a number")? {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid("llm", "temperature", "temperature must be between 0 and 2"));
        }
    }
    if let Some(timeout) = parsed::<i64>(config, "llm", "timeout_secs", "an integer")? {
        if timeout <= 0 {
            return Err(invalid("llm", "timeout_secs", "timeout_secs must be positive"));
        }
    }
    if let Some(env) = config.get_string("llm", "api_key_env") {
        if env.contains(char::is_whitespace) || env.contains('=') {
            return Err(invalid(
                "llm",
                "api_key_env",
                "api_key_env must be an environment variable name",
            ));
        }
    }
    Ok(())
}

fn validate_data(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    match config.get_string("data", "provider").as_deref() {
        None | Some("yahoo") => {}
        Some("csv") => {
            if config.get_string("data", "csv_dir").is_none() {
                return Err(StratforgeError::ConfigMissing {
                    section: "data".to_string(),
                    key: "csv_dir".to_string(),
                });
            }
        }
        Some(other) => {
            return Err(invalid(
                "data",
                "provider",
                format!("unknown provider '{other}' (expected yahoo or csv)"),
            ));
        }
    }
    validate_url(config, "data", "yahoo_base_url")
}

fn validate_sandbox(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    let timeout = parsed::<i64>(config, "sandbox", "timeout_secs", "an integer")?;
    if matches!(timeout, Some(t) if t <= 0) {
        return Err(invalid("sandbox", "timeout_secs", "timeout_secs must be positive"));
    }
    if let Some(memory) = parsed::<i64>(config, "sandbox", "max_memory_mb", "an integer")? {
        if memory < 64 {
            return Err(invalid(
                "sandbox",
                "max_memory_mb",
                "max_memory_mb must be at least 64",
            ));
        }
    }
    if let Some(cpu) = parsed::<i64>(config, "sandbox", "cpu_seconds", "an integer")? {
        if cpu <= 0 {
            return Err(invalid("sandbox", "cpu_seconds", "cpu_seconds must be positive"));
        }
    }
    if let Some(raw) = config.get_string("sandbox", "isolate_network") {
        let known = ["true", "false", "yes", "no", "on", "off", "1", "0"];
        if !known.contains(&raw.to_lowercase().as_str()) {
            return Err(invalid(
                "sandbox",
                "isolate_network",
                format!("'{raw}' is not a boolean"),
            ));
        }
    }
    Ok(())
}

fn validate_pipeline(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    if let Some(attempts) = parsed::<i64>(config, "pipeline", "max_repair_attempts", "an integer")? {
        if !(0..=10).contains(&attempts) {
            return Err(invalid(
                "pipeline",
                "max_repair_attempts",
                "max_repair_attempts must be between 0 and 10",
            ));
        }
    }
    Ok(())
}

fn validate_backtest(config: &dyn ConfigPort) -> Result<(), StratforgeError> {
    for key in ["commission_per_trade", "commission_pct", "slippage_pct"] {
        if let Some(value) = parsed::<f64>(config, "backtest", key, "a number")? {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid("backtest", key, format!("{key} must be non-negative")));
            }
        }
    }
    if let Some(rate) = parsed::<f64>(config, "backtest", "risk_free_rate", "a number")? {
        if !(0.0..1.0).contains(&rate) {
            return Err(invalid(
                "backtest",
                "risk_free_rate",
                "risk_free_rate must be between 0 and 1",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn check(ini: &str) -> Result<(), StratforgeError> {
        let config = FileConfigAdapter::from_string(ini).unwrap();
        validate_settings(&config)
    }

    fn assert_invalid(ini: &str, expected_key: &str) {
        match check(ini) {
            Err(StratforgeError::ConfigInvalid { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("expected ConfigInvalid for {expected_key}, got {other:?}"),
        }
    }

    #[test]
    fn empty_settings_are_valid() {
        assert!(check("").is_ok());
    }

    #[test]
    fn full_settings_are_valid() {
        let ini = r#"
[llm]
base_url = https://openrouter.ai/api/v1
model = anthropic/claude-3.5-sonnet
api_key_env = OPENROUTER_API_KEY
temperature = 0.1
timeout_secs = 60

[data]
provider = csv
csv_dir = /var/data/bars

[sandbox]
timeout_secs = 30
max_memory_mb = 2048
cpu_seconds = 31
isolate_network = yes

[pipeline]
max_repair_attempts = 3

[backtest]
commission_pct = 0.1
slippage_pct = 0.05
risk_free_rate = 0.04
"#;
        assert!(check(ini).is_ok());
    }

    #[test]
    fn rejects_bad_llm_values() {
        assert_invalid("[llm]\nbase_url = openrouter.ai\n", "base_url");
        assert_invalid("[llm]\ntemperature = 3.5\n", "temperature");
        assert_invalid("[llm]\ntimeout_secs = 0\n", "timeout_secs");
        assert_invalid("[llm]\ntimeout_secs = soon\n", "timeout_secs");
        assert_invalid("[llm]\napi_key_env = MY KEY\n", "api_key_env");
    }

    #[test]
    fn csv_provider_requires_directory() {
        match check("[data]\nprovider = csv\n") {
            Err(StratforgeError::ConfigMissing { section, key }) => {
                assert_eq!(section, "data");
                assert_eq!(key, "csv_dir");
            }
            other => panic!("expected ConfigMissing, got {other:?}"),
        }
        assert_invalid("[data]\nprovider = bloomberg\n", "provider");
    }

    #[test]
    fn rejects_bad_sandbox_values() {
        assert_invalid("[sandbox]\ntimeout_secs = -1\n", "timeout_secs");
        assert_invalid("[sandbox]\nmax_memory_mb = 16\n", "max_memory_mb");
        assert_invalid("[sandbox]\ncpu_seconds = 0\n", "cpu_seconds");
        assert_invalid("[sandbox]\nisolate_network = sometimes\n", "isolate_network");
    }

    #[test]
    fn rejects_bad_pipeline_and_backtest_values() {
        assert_invalid("[pipeline]\nmax_repair_attempts = 50\n", "max_repair_attempts");
        assert_invalid("[backtest]\ncommission_pct = -0.1\n", "commission_pct");
        assert_invalid("[backtest]\nslippage_pct = abc\n", "slippage_pct");
        assert_invalid("[backtest]\nrisk_free_rate = 1.5\n", "risk_free_rate");
    }
}
