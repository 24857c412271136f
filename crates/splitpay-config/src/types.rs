//! Configuration types for the settlement service.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete service configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
	/// Service identity and HTTP settings
	#[serde(default)]
	pub service: ServiceConfig,
	/// Settlement timing and money rules
	#[serde(default)]
	pub settlement: SettlementConfig,
	/// Payment provider selection
	#[serde(default)]
	pub payment: PaymentConfig,
	/// Shared store backend
	#[serde(default)]
	pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	#[serde(default = "default_name")]
	pub name: String,
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_http_port")]
	pub http_port: u16,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			name: default_name(),
			host: default_host(),
			http_port: default_http_port(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettlementConfig {
	/// How often each coordinator re-reads the store.
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	/// How long a session may stay unsettled before it expires.
	#[serde(default = "default_session_timeout_secs")]
	pub session_timeout_secs: u64,
	/// Tolerance when reconciling custom shares against the total.
	#[serde(default = "default_split_epsilon")]
	pub split_epsilon: Decimal,
	/// Currency code shown to users.
	#[serde(default = "default_currency")]
	pub currency: String,
	/// Buffered events per session before slow subscribers lag.
	#[serde(default = "default_event_capacity")]
	pub event_capacity: usize,
}

impl SettlementConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn session_timeout(&self) -> Duration {
		Duration::from_secs(self.session_timeout_secs)
	}
}

impl Default for SettlementConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: default_poll_interval_ms(),
			session_timeout_secs: default_session_timeout_secs(),
			split_epsilon: default_split_epsilon(),
			currency: default_currency(),
			event_capacity: default_event_capacity(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentConfig {
	/// Provider implementation name.
	#[serde(default = "default_payment_provider")]
	pub provider: String,
	/// Provider-specific parameters.
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

impl Default for PaymentConfig {
	fn default() -> Self {
		Self {
			provider: default_payment_provider(),
			config: empty_table(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Backend implementation name.
	#[serde(default = "default_storage_backend")]
	pub backend: String,
	/// Backend-specific parameters.
	#[serde(default = "empty_table")]
	pub config: toml::Value,
}

impl Default for StorageConfig {
	fn default() -> Self {
		Self {
			backend: default_storage_backend(),
			config: empty_table(),
		}
	}
}

fn default_name() -> String {
	"splitpay".to_string()
}

fn default_host() -> String {
	"0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
	8080
}

fn default_poll_interval_ms() -> u64 {
	2_500
}

fn default_session_timeout_secs() -> u64 {
	30 * 60
}

fn default_split_epsilon() -> Decimal {
	Decimal::new(1, 2)
}

fn default_currency() -> String {
	"RM".to_string()
}

fn default_event_capacity() -> usize {
	256
}

fn default_payment_provider() -> String {
	"simulated".to_string()
}

fn default_storage_backend() -> String {
	"memory".to_string()
}

fn empty_table() -> toml::Value {
	toml::Value::Table(toml::map::Map::new())
}
