use std::collections::HashMap;

use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, Map, Source, Value};
use serde::Deserialize;

use crate::constants::{DEFAULT_FANOUT_PORT, DEFAULT_MULTI_CLAIM_THRESHOLD, DEFAULT_RATE_LIMIT_RPS};

/// The only display zone the time service implements.
pub const SUPPORTED_TIMEZONE: &str = "Asia/Taipei";

// BNB Smart Chain public endpoints and the prediction contract they serve.
const DEFAULT_RPC_URL: &str = "https://bsc-dataseed.binance.org";
const DEFAULT_RPC_WS_URL: &str = "wss://bsc-rpc.publicnode.com";
const DEFAULT_CONTRACT_ADDRESS: &str = "0x18B2A687610328590Bc8F2e5fEdDe3b582A49cdA";

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
	/// Postgres connection string. Required; there is no default.
	pub database_url: String,
	pub rpc_url: String,
	pub rpc_ws_url: String,
	pub contract_address: String,
	pub rate_limit_rps: u32,
	pub fanout_port: u16,
	pub multi_claim_threshold: i64,
	pub timezone: String,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct SettingsOptions {
	#[clap(long = "database_url")]
	database_url: Option<String>,
	#[clap(long = "rpc_url")]
	rpc_url: Option<String>,
	#[clap(long = "rpc_ws_url")]
	rpc_ws_url: Option<String>,
	#[clap(long = "contract_address")]
	contract_address: Option<String>,
	#[clap(long = "rate_limit_rps")]
	rate_limit_rps: Option<u32>,
	#[clap(long = "fanout_port")]
	fanout_port: Option<u16>,
	#[clap(long = "multi_claim_threshold")]
	multi_claim_threshold: Option<i64>,
}

pub fn insert_command_line_option<T: ToString>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) {
	if let Some(value) = option {
		map.insert(key.to_string(), Value::from(value.to_string()));
	}
}

impl Source for SettingsOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "database_url", &self.database_url);
		insert_command_line_option(&mut map, "rpc_url", &self.rpc_url);
		insert_command_line_option(&mut map, "rpc_ws_url", &self.rpc_ws_url);
		insert_command_line_option(&mut map, "contract_address", &self.contract_address);
		insert_command_line_option(&mut map, "rate_limit_rps", &self.rate_limit_rps);
		insert_command_line_option(&mut map, "fanout_port", &self.fanout_port);
		insert_command_line_option(&mut map, "multi_claim_threshold", &self.multi_claim_threshold);

		Ok(map)
	}
}

impl Settings {
	/// Defaults, then environment variables (`DATABASE_URL`, `RPC_URL`, ...), then command
	/// line options. Missing `DATABASE_URL` surfaces here as a configuration error.
	pub fn load(opts: SettingsOptions) -> Result<Self, ConfigError> {
		let mut settings: Settings = Self::set_defaults(Config::builder())?
			.add_source(Environment::default())
			.add_source(opts)
			.build()?
			.try_deserialize()?;
		settings.validate()?;
		Ok(settings)
	}

	fn set_defaults(
		config_builder: ConfigBuilder<config::builder::DefaultState>,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		config_builder
			.set_default("rpc_url", DEFAULT_RPC_URL)?
			.set_default("rpc_ws_url", DEFAULT_RPC_WS_URL)?
			.set_default("contract_address", DEFAULT_CONTRACT_ADDRESS)?
			.set_default("rate_limit_rps", DEFAULT_RATE_LIMIT_RPS as i64)?
			.set_default("fanout_port", DEFAULT_FANOUT_PORT as i64)?
			.set_default("multi_claim_threshold", DEFAULT_MULTI_CLAIM_THRESHOLD)?
			.set_default("timezone", SUPPORTED_TIMEZONE)
	}

	fn validate(&mut self) -> Result<(), ConfigError> {
		if self.database_url.trim().is_empty() {
			return Err(ConfigError::Message("database_url must not be empty".to_string()));
		}
		if self.rate_limit_rps == 0 {
			return Err(ConfigError::Message("rate_limit_rps must be at least 1".to_string()));
		}
		if self.fanout_port == 0 {
			return Err(ConfigError::Message("fanout_port must not be 0".to_string()));
		}
		if self.timezone != SUPPORTED_TIMEZONE {
			return Err(ConfigError::Message(format!(
				"timezone {:?} is not supported; only {SUPPORTED_TIMEZONE} timestamps are canonical",
				self.timezone
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn new_test_settings() -> Settings {
		Settings {
			database_url: "postgres://postgres@localhost:5432/prediction".to_string(),
			rpc_url: DEFAULT_RPC_URL.to_string(),
			rpc_ws_url: DEFAULT_RPC_WS_URL.to_string(),
			contract_address: DEFAULT_CONTRACT_ADDRESS.to_string(),
			rate_limit_rps: DEFAULT_RATE_LIMIT_RPS,
			fanout_port: DEFAULT_FANOUT_PORT,
			multi_claim_threshold: DEFAULT_MULTI_CLAIM_THRESHOLD,
			timezone: SUPPORTED_TIMEZONE.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_line_options_override_defaults() {
		let opts = SettingsOptions {
			database_url: Some("postgres://elsewhere/db".to_string()),
			rate_limit_rps: Some(25),
			..Default::default()
		};
		let settings = Settings::load(opts).unwrap();
		assert_eq!(settings.database_url, "postgres://elsewhere/db");
		assert_eq!(settings.rate_limit_rps, 25);
		assert_eq!(settings.fanout_port, DEFAULT_FANOUT_PORT);
	}

	#[test]
	fn missing_database_url_is_a_configuration_error() {
		// No default exists for database_url, so empty options must fail to load.
		// (Only meaningful when DATABASE_URL is not exported into the test environment.)
		if std::env::var("DATABASE_URL").is_err() {
			assert!(Settings::load(SettingsOptions::default()).is_err());
		}
	}

	#[test]
	fn unsupported_timezone_is_rejected() {
		let mut settings = test_utils::new_test_settings();
		settings.timezone = "UTC".to_string();
		assert!(settings.validate().is_err());
	}
}
