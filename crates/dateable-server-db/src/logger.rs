// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Context-scoped structured logger.
//!
//! Wraps `tracing` with an accumulated metadata map so that every log line
//! emitted on behalf of a request or job carries its identity (context id,
//! control name, job name, ...) without each call site repeating it.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

/// A logger carrying default metadata, emitted with every line.
///
/// Cloning shares the underlying metadata map (same logical logger); use
/// [`ContextLogger::child`] to derive a logger with an independent snapshot
/// of the metadata, as done when a context is cloned for a transaction.
#[derive(Clone)]
pub struct ContextLogger {
	metadata: Arc<Mutex<Map<String, Value>>>,
}

impl ContextLogger {
	pub fn root() -> Self {
		Self {
			metadata: Arc::new(Mutex::new(Map::new())),
		}
	}

	/// Derive a logger with a snapshot copy of the current metadata.
	/// Later additions on either side do not affect the other.
	pub fn child(&self) -> Self {
		Self {
			metadata: Arc::new(Mutex::new(self.snapshot())),
		}
	}

	/// Merge fields into the default metadata.
	pub fn add_metadata(&self, fields: Map<String, Value>) {
		let mut metadata = self.metadata.lock().expect("logger metadata poisoned");
		for (key, value) in fields {
			metadata.insert(key, value);
		}
	}

	/// Snapshot of the current default metadata.
	pub fn snapshot(&self) -> Map<String, Value> {
		self.metadata.lock().expect("logger metadata poisoned").clone()
	}

	fn context_json(&self) -> String {
		serde_json::to_string(&*self.metadata.lock().expect("logger metadata poisoned"))
			.unwrap_or_default()
	}

	pub fn info(&self, message: &str) {
		tracing::info!(context = %self.context_json(), "{message}");
	}

	pub fn warn(&self, message: &str) {
		tracing::warn!(context = %self.context_json(), "{message}");
	}

	pub fn error(&self, message: &str) {
		tracing::error!(context = %self.context_json(), "{message}");
	}

	/// Log an error with additional structured details.
	pub fn error_with(&self, message: &str, details: Value) {
		tracing::error!(context = %self.context_json(), details = %details, "{message}");
	}
}

impl std::fmt::Debug for ContextLogger {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ContextLogger")
			.field("metadata", &self.snapshot())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.clone()))
			.collect()
	}

	#[test]
	fn test_add_metadata_merges() {
		let logger = ContextLogger::root();
		logger.add_metadata(fields(&[("a", json!(1))]));
		logger.add_metadata(fields(&[("b", json!(2)), ("a", json!(3))]));

		let snapshot = logger.snapshot();
		assert_eq!(snapshot.get("a"), Some(&json!(3)));
		assert_eq!(snapshot.get("b"), Some(&json!(2)));
	}

	#[test]
	fn test_clone_shares_metadata() {
		let logger = ContextLogger::root();
		let alias = logger.clone();
		alias.add_metadata(fields(&[("shared", json!(true))]));
		assert_eq!(logger.snapshot().get("shared"), Some(&json!(true)));
	}

	#[test]
	fn test_child_is_isolated() {
		let parent = ContextLogger::root();
		parent.add_metadata(fields(&[("a", json!(1))]));

		let child = parent.child();
		child.add_metadata(fields(&[("b", json!(2))]));

		assert_eq!(parent.snapshot().get("b"), None);
		assert_eq!(child.snapshot().get("a"), Some(&json!(1)));
		assert_eq!(child.snapshot().get("b"), Some(&json!(2)));
	}
}
