// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration layer, merged across sources.

use serde::Deserialize;

use crate::sections::{DatabaseConfigLayer, JobsConfigLayer, LoggingConfigLayer};

/// A partial server configuration as read from a single source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigLayer {
	#[serde(default)]
	pub database: Option<DatabaseConfigLayer>,
	#[serde(default)]
	pub jobs: Option<JobsConfigLayer>,
	#[serde(default)]
	pub logging: Option<LoggingConfigLayer>,
}

impl ServerConfigLayer {
	/// Merge `other` on top of this layer; fields set in `other` win.
	pub fn merge(&mut self, other: ServerConfigLayer) {
		merge_section(&mut self.database, other.database, DatabaseConfigLayer::merge);
		merge_section(&mut self.jobs, other.jobs, JobsConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
	}
}

fn merge_section<T>(base: &mut Option<T>, other: Option<T>, merge: fn(&mut T, T)) {
	match (base.as_mut(), other) {
		(Some(base), Some(other)) => merge(base, other),
		(None, Some(other)) => *base = Some(other),
		(_, None) => {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_merge_sections() {
		let mut base = ServerConfigLayer {
			database: Some(DatabaseConfigLayer {
				url: Some("sqlite:a.db".to_string()),
				max_connections: None,
			}),
			..Default::default()
		};
		let overlay = ServerConfigLayer {
			database: Some(DatabaseConfigLayer {
				url: None,
				max_connections: Some(3),
			}),
			jobs: Some(JobsConfigLayer {
				run_jobs: Some(false),
				..Default::default()
			}),
			..Default::default()
		};
		base.merge(overlay);

		let database = base.database.unwrap();
		assert_eq!(database.url.as_deref(), Some("sqlite:a.db"));
		assert_eq!(database.max_connections, Some(3));
		assert_eq!(base.jobs.unwrap().run_jobs, Some(false));
		assert!(base.logging.is_none());
	}

	#[test]
	fn test_parse_full_toml() {
		let layer: ServerConfigLayer = toml::from_str(
			r#"
[database]
url = "sqlite:/srv/dateable.db"

[jobs]
run_jobs = false

[logging]
level = "debug"
"#,
		)
		.unwrap();
		assert!(layer.database.is_some());
		assert_eq!(layer.jobs.unwrap().run_jobs, Some(false));
		assert_eq!(layer.logging.unwrap().level.as_deref(), Some("debug"));
	}
}
