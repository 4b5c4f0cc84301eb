//! INI adapter behind [`ConfigPort`], used for the settings file and for
//! compiled strategy programs.
//!
//! Section and key names are case-insensitive. Booleans accept
//! `true/false`, `yes/no`, `on/off` and `1/0`.

use std::path::Path;
use std::str::FromStr;

use configparser::ini::Ini;

use crate::ports::config_port::ConfigPort;

#[derive(Debug)]
pub struct FileConfigAdapter {
    ini: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_string(&content)
    }

    pub fn from_string(content: &str) -> Result<Self, String> {
        let mut ini = Ini::new();
        ini.read(content.to_string())?;
        Ok(Self { ini })
    }

    /// Section names present in the document, sorted.
    pub fn sections(&self) -> Vec<String> {
        let mut sections = self.ini.sections();
        sections.sort();
        sections
    }

    fn parsed<T: FromStr>(&self, section: &str, key: &str) -> Option<T> {
        self.get_string(section, key)
            .and_then(|v| v.trim().parse::<T>().ok())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.ini
            .get(section, key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
        self.parsed(section, key).unwrap_or(default)
    }

    fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
        self.parsed(section, key).unwrap_or(default)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.get_string(section, key)
            .as_deref()
            .and_then(parse_bool)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SETTINGS: &str = r#"
; stratforge settings
[llm]
model = anthropic/claude-3.5-sonnet
temperature = 0.2
timeout_secs = 45

[sandbox]
isolate_network = off
max_memory_mb = 1024

[Pipeline]
Max_Repair_Attempts = 5
"#;

    #[test]
    fn reads_typed_values() {
        let config = FileConfigAdapter::from_string(SETTINGS).unwrap();
        assert_eq!(
            config.get_string("llm", "model").as_deref(),
            Some("anthropic/claude-3.5-sonnet")
        );
        assert_eq!(config.get_double("llm", "temperature", 0.0), 0.2);
        assert_eq!(config.get_int("llm", "timeout_secs", 60), 45);
        assert_eq!(config.get_int("sandbox", "max_memory_mb", 0), 1024);
        assert!(!config.get_bool("sandbox", "isolate_network", true));
    }

    #[test]
    fn names_are_case_insensitive() {
        let config = FileConfigAdapter::from_string(SETTINGS).unwrap();
        assert_eq!(config.get_int("pipeline", "max_repair_attempts", 3), 5);
        assert!(config.has_key("PIPELINE", "max_repair_attempts"));
    }

    #[test]
    fn missing_and_unparsable_values_fall_back() {
        let config = FileConfigAdapter::from_string(
            "[backtest]\ncommission_pct = lots\nallow_shorting = maybe\nempty =\n",
        )
        .unwrap();
        assert_eq!(config.get_double("backtest", "commission_pct", 0.1), 0.1);
        assert_eq!(config.get_int("backtest", "missing", 7), 7);
        assert!(config.get_bool("backtest", "allow_shorting", true));
        assert_eq!(config.get_string("backtest", "empty"), None);
        assert!(!config.has_key("backtest", "empty"));
    }

    #[test]
    fn strategy_program_rules_survive_parsing() {
        let config = FileConfigAdapter::from_string(
            "[strategy]\nentry_long = AND(CROSS_ABOVE(EMA(12), EMA(26)), ABOVE(RSI(14), 50))\n",
        )
        .unwrap();
        assert_eq!(
            config.get_string("strategy", "entry_long").as_deref(),
            Some("AND(CROSS_ABOVE(EMA(12), EMA(26)), ABOVE(RSI(14), 50))")
        );
    }

    #[test]
    fn from_file_reads_and_lists_sections() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[data]\nprovider = csv\n\n[llm]\nmodel = m\n").unwrap();
        let config = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(config.get_string("data", "provider").as_deref(), Some("csv"));
        assert_eq!(config.sections(), vec!["data".to_string(), "llm".to_string()]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = FileConfigAdapter::from_file("/nonexistent/stratforge.ini").unwrap_err();
        assert!(err.contains("/nonexistent/stratforge.ini"));
    }
}
