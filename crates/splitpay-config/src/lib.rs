//! Configuration loading for the settlement service.
//!
//! Configuration comes from a TOML, JSON or YAML file (chosen by extension),
//! with `${VAR}` placeholders substituted from the environment and a few
//! prefixed environment variables overriding individual settings.

use regex::Regex;
use rust_decimal::Decimal;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
	Toml,
	Json,
	Yaml,
}

impl ConfigFormat {
	/// Picks the format from a file extension.
	pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
		match path.extension().and_then(|s| s.to_str()) {
			Some("toml") => Ok(ConfigFormat::Toml),
			Some("json") => Ok(ConfigFormat::Json),
			Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
			_ => Err(ConfigError::ParseError(format!(
				"Unsupported config format: {:?}",
				path
			))),
		}
	}
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "SPLITPAY_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<Config, ConfigError> {
		// Load base configuration from file
		let mut config = if let Some(file_path) = &self.file_path {
			self.load_from_file(file_path).await?
		} else {
			return Err(ConfigError::FileNotFound(
				"No configuration file specified".to_string(),
			));
		};

		// Apply environment variable overrides
		self.apply_env_overrides(&mut config)?;

		// Validate configuration
		validate_config(&config)?;

		Ok(config)
	}

	/// Parses a configuration document that is already in memory.
	pub fn load_from_str(&self, content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
		let substituted = substitute_env_vars(content)?;
		let mut config = parse(&substituted, format)?;
		self.apply_env_overrides(&mut config)?;
		validate_config(&config)?;
		Ok(config)
	}

	async fn load_from_file(&self, file_path: &str) -> Result<Config, ConfigError> {
		let path = Path::new(file_path);
		info!("Loading configuration from {:?}", path);

		let format = ConfigFormat::from_path(path)?;
		let content = match tokio::fs::read_to_string(path).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(ConfigError::FileNotFound(file_path.to_string()))
			}
			Err(e) => return Err(e.into()),
		};

		// Substitute environment variables
		let substituted_content = substitute_env_vars(&content)?;

		parse(&substituted_content, format)
	}

	fn apply_env_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
		if let Ok(http_port) = env::var(format!("{}HTTP_PORT", self.env_prefix)) {
			debug!("Overriding HTTP port from environment");
			config.service.http_port = http_port
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid HTTP port: {}", e)))?;
		}

		if let Ok(interval) = env::var(format!("{}POLL_INTERVAL_MS", self.env_prefix)) {
			config.settlement.poll_interval_ms = interval.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid poll interval: {}", e))
			})?;
		}

		Ok(())
	}
}

fn parse(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
	match format {
		ConfigFormat::Toml => {
			toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
		}
		ConfigFormat::Json => {
			serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
		}
		ConfigFormat::Yaml => {
			serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
		}
	}
}

/// Replaces every `${VAR_NAME}` with the value of that environment variable.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let mut result = content.to_string();

	let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::ParseError(e.to_string()))?;

	for cap in re.captures_iter(content) {
		let full_match = &cap[0];
		let var_name = &cap[1];

		let env_value =
			env::var(var_name).map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;

		result = result.replace(full_match, &env_value);
	}

	Ok(result)
}

/// Checks cross-field rules serde cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
	let settlement = &config.settlement;

	if settlement.poll_interval_ms == 0 {
		return Err(ConfigError::ValidationError(
			"settlement.poll_interval_ms must be greater than zero".to_string(),
		));
	}

	if settlement.session_timeout() <= settlement.poll_interval() {
		return Err(ConfigError::ValidationError(
			"settlement.session_timeout_secs must exceed the poll interval".to_string(),
		));
	}

	if settlement.split_epsilon < Decimal::ZERO {
		return Err(ConfigError::ValidationError(
			"settlement.split_epsilon must not be negative".to_string(),
		));
	}

	if settlement.event_capacity == 0 {
		return Err(ConfigError::ValidationError(
			"settlement.event_capacity must be greater than zero".to_string(),
		));
	}

	match config.payment.provider.as_str() {
		"simulated" => {
			if let Some(rate) = config.payment.config.get("success_rate") {
				let rate = rate.as_float().ok_or_else(|| {
					ConfigError::ValidationError(
						"payment.config.success_rate must be a number".to_string(),
					)
				})?;
				if !(0.0..=1.0).contains(&rate) {
					return Err(ConfigError::ValidationError(format!(
						"payment.config.success_rate must be within [0, 1], got {}",
						rate
					)));
				}
			}
		}
		other => {
			return Err(ConfigError::ValidationError(format!(
				"Unknown payment provider: {}",
				other
			)))
		}
	}

	match config.storage.backend.as_str() {
		"memory" => {}
		"file" => {
			if let Some(path) = config.storage.config.get("storage_path") {
				if path.as_str().map_or(true, |p| p.trim().is_empty()) {
					return Err(ConfigError::ValidationError(
						"storage.config.storage_path must be a non-empty string".to_string(),
					));
				}
			}
		}
		other => {
			return Err(ConfigError::ValidationError(format!(
				"Unknown storage backend: {}",
				other
			)))
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
[service]
name = "campus-split"
http_port = 9090

[settlement]
poll_interval_ms = 2000
session_timeout_secs = 1800
split_epsilon = "0.01"

[payment]
provider = "simulated"
config = { success_rate = 0.9 }

[storage]
backend = "file"
config = { storage_path = "./data/split" }
"#;

	#[test]
	fn test_load_from_toml_string() {
		let config = ConfigLoader::new()
			.with_env_prefix("SPLITPAY_TEST_UNUSED_")
			.load_from_str(SAMPLE, ConfigFormat::Toml)
			.unwrap();
		assert_eq!(config.service.name, "campus-split");
		assert_eq!(config.service.http_port, 9090);
		assert_eq!(config.settlement.poll_interval_ms, 2000);
		assert_eq!(config.storage.backend, "file");
	}

	#[test]
	fn test_load_from_json_string() {
		let json = r#"{
			"settlement": { "poll_interval_ms": 500, "session_timeout_secs": 60 },
			"storage": { "backend": "memory" }
		}"#;
		let config = ConfigLoader::new()
			.with_env_prefix("SPLITPAY_TEST_UNUSED_")
			.load_from_str(json, ConfigFormat::Json)
			.unwrap();
		assert_eq!(config.settlement.poll_interval_ms, 500);
		assert_eq!(config.payment.provider, "simulated");
	}

	#[test]
	fn test_env_substitution() {
		env::set_var("SPLITPAY_TEST_STORAGE_DIR", "/tmp/splitpay-test");
		let content = r#"
[storage]
backend = "file"
config = { storage_path = "${SPLITPAY_TEST_STORAGE_DIR}" }
"#;
		let config = ConfigLoader::new()
			.with_env_prefix("SPLITPAY_TEST_UNUSED_")
			.load_from_str(content, ConfigFormat::Toml)
			.unwrap();
		assert_eq!(
			config
				.storage
				.config
				.get("storage_path")
				.and_then(|v| v.as_str()),
			Some("/tmp/splitpay-test")
		);
	}

	#[test]
	fn test_missing_env_var_is_reported() {
		let content = "[service]\nname = \"${SPLITPAY_TEST_DEFINITELY_UNSET}\"\n";
		let err = ConfigLoader::new()
			.load_from_str(content, ConfigFormat::Toml)
			.unwrap_err();
		assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "SPLITPAY_TEST_DEFINITELY_UNSET"));
	}

	#[test]
	fn test_env_override_of_poll_interval() {
		env::set_var("SPLITPAY_OVR_POLL_INTERVAL_MS", "750");
		let config = ConfigLoader::new()
			.with_env_prefix("SPLITPAY_OVR_")
			.load_from_str("", ConfigFormat::Toml)
			.unwrap();
		assert_eq!(config.settlement.poll_interval_ms, 750);
	}

	#[test]
	fn test_validation_rejects_bad_values() {
		let mut config = Config::default();
		config.settlement.poll_interval_ms = 0;
		assert!(validate_config(&config).is_err());

		let mut config = Config::default();
		config.settlement.session_timeout_secs = 1;
		assert!(validate_config(&config).is_err());

		let mut config = Config::default();
		config.payment.config = toml::from_str("success_rate = 2.0").unwrap();
		assert!(validate_config(&config).is_err());

		let mut config = Config::default();
		config.storage.backend = "postgres".to_string();
		assert!(validate_config(&config).is_err());

		assert!(validate_config(&Config::default()).is_ok());
	}

	#[tokio::test]
	async fn test_load_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("splitpay.toml");
		std::fs::write(&path, SAMPLE).unwrap();

		let config = ConfigLoader::new()
			.with_file(&path)
			.with_env_prefix("SPLITPAY_TEST_UNUSED_")
			.load()
			.await
			.unwrap();
		assert_eq!(config.service.name, "campus-split");

		let missing = ConfigLoader::new()
			.with_file(dir.path().join("absent.toml"))
			.load()
			.await;
		assert!(matches!(missing, Err(ConfigError::FileNotFound(_))));
	}

	#[test]
	fn test_unsupported_extension() {
		assert!(ConfigFormat::from_path(Path::new("config.ini")).is_err());
		assert_eq!(
			ConfigFormat::from_path(Path::new("config.yml")).unwrap(),
			ConfigFormat::Yaml
		);
	}
}
