//! INI file configuration adapter.

use crate::domain::error::StratboxError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

#[derive(Debug)]
pub struct FileConfigAdapter {
    config: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StratboxError> {
        let path = path.as_ref();
        let mut config = Ini::new();
        config.load(path).map_err(|reason| StratboxError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, StratboxError> {
        let mut config = Ini::new();
        config
            .read(content.to_string())
            .map_err(|reason| StratboxError::ConfigParse {
                file: "<string>".into(),
                reason,
            })?;
        Ok(Self { config })
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn from_string_parses_sections() {
        let content = r#"
[sandbox]
timeout_seconds = 10
memory_limit_mb = 256

[metrics]
risk_free_rate = 0.03
"#;
        let adapter = FileConfigAdapter::from_string(content).unwrap();
        assert_eq!(adapter.get_string("sandbox", "memory_limit_mb").as_deref(), Some("256"));
        assert_eq!(adapter.get_string("metrics", "risk_free_rate").as_deref(), Some("0.03"));
        assert_eq!(
            adapter.get_string("sandbox", "timeout_seconds"),
            Some("10".to_string())
        );
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let adapter = FileConfigAdapter::from_string("[sandbox]\n").unwrap();
        assert_eq!(adapter.get_string("sandbox", "missing"), None);
        assert_eq!(adapter.get_string("nosection", "key"), None);
    }

    #[test]
    fn values_are_trimmed_strings() {
        let adapter = FileConfigAdapter::from_string("[sandbox]\ntimeout_seconds =   soon  \n").unwrap();
        assert_eq!(adapter.get_string("sandbox", "timeout_seconds").as_deref(), Some("soon"));
    }

    #[test]
    fn from_file_reads_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[metrics]\nperiods_per_year = 52\n").unwrap();
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(adapter.get_string("metrics", "periods_per_year").as_deref(), Some("52"));
    }

    #[test]
    fn from_file_missing_is_config_parse_error() {
        let err = FileConfigAdapter::from_file("/nonexistent/path/stratbox.ini").unwrap_err();
        assert!(matches!(err, StratboxError::ConfigParse { .. }));
        assert_eq!(err.exit_status(), 2);
    }
}
