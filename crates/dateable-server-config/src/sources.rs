// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: defaults, TOML files and environment variables.

use std::path::PathBuf;

use tracing::debug;

use crate::error::ConfigError;
use crate::layer::ServerConfigLayer;
use crate::sections::{DatabaseConfigLayer, JobsConfigLayer, LoggingConfigLayer};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ServerConfigLayer::default())
	}
}

/// TOML file configuration source.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/dateable/server.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ServerConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ServerConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: DATEABLE_SERVER_<SECTION>_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ServerConfigLayer {
			database: Some(load_database_from_env()?),
			jobs: Some(load_jobs_from_env()?),
			logging: Some(load_logging_from_env()?),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u32 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u64 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn load_database_from_env() -> Result<DatabaseConfigLayer, ConfigError> {
	Ok(DatabaseConfigLayer {
		url: env_var("DATEABLE_SERVER_DATABASE_URL"),
		max_connections: env_u32("DATEABLE_SERVER_DATABASE_MAX_CONNECTIONS")?,
	})
}

fn load_jobs_from_env() -> Result<JobsConfigLayer, ConfigError> {
	Ok(JobsConfigLayer {
		run_jobs: env_bool("DATEABLE_SERVER_RUN_JOBS"),
		test_mode: env_bool("DATEABLE_SERVER_TEST_MODE"),
		schedule_tick_secs: env_u64("DATEABLE_SERVER_JOBS_SCHEDULE_TICK_SECS")?,
		completed_retention_hours: env_u64("DATEABLE_SERVER_JOBS_COMPLETED_RETENTION_HOURS")?,
	})
}

fn load_logging_from_env() -> Result<LoggingConfigLayer, ConfigError> {
	Ok(LoggingConfigLayer {
		level: env_var("DATEABLE_SERVER_LOG_LEVEL"),
		json: env_bool("DATEABLE_SERVER_LOG_JSON"),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_missing_toml_file_yields_empty_layer() {
		let source = TomlSource::new("/nonexistent/dateable-test.toml");
		let layer = source.load().unwrap();
		assert!(layer.database.is_none());
		assert!(layer.jobs.is_none());
	}

	#[test]
	fn test_env_bool_parsing() {
		std::env::set_var("DATEABLE_TEST_ENV_BOOL_TRUE", "TRUE");
		std::env::set_var("DATEABLE_TEST_ENV_BOOL_ONE", "1");
		std::env::set_var("DATEABLE_TEST_ENV_BOOL_OFF", "off");
		assert_eq!(env_bool("DATEABLE_TEST_ENV_BOOL_TRUE"), Some(true));
		assert_eq!(env_bool("DATEABLE_TEST_ENV_BOOL_ONE"), Some(true));
		assert_eq!(env_bool("DATEABLE_TEST_ENV_BOOL_OFF"), Some(false));
		assert_eq!(env_bool("DATEABLE_TEST_ENV_BOOL_UNSET"), None);
	}

	#[test]
	fn test_env_u64_rejects_garbage() {
		std::env::set_var("DATEABLE_TEST_ENV_U64_BAD", "sixty");
		assert!(env_u64("DATEABLE_TEST_ENV_U64_BAD").is_err());
	}

	#[test]
	fn test_precedence_ordering() {
		assert!(Precedence::Environment > Precedence::ConfigFile);
		assert!(Precedence::ConfigFile > Precedence::Defaults);
	}
}
