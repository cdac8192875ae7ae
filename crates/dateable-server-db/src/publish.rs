// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Seam between the database layer and the job queue.
//!
//! The database service buffers job instances enqueued inside an open
//! transaction and publishes them only after commit. It talks to the queue
//! through [`JobPublisher`] so the jobs crate can plug in without a
//! dependency cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Publish-time options for a queued job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
	pub retry_limit: Option<u32>,
	pub retry_delay_secs: Option<u64>,
	pub retry_backoff: Option<bool>,
	pub expire_in_minutes: Option<u64>,
	/// At most one job with the same key may be queued at a time (or per
	/// window when `singleton_seconds` is set).
	pub singleton_key: Option<String>,
	pub singleton_seconds: Option<u64>,
	pub start_after: Option<DateTime<Utc>>,
}

/// A serializable, queued unit of deferred work: payload + target queue +
/// publish options. Exists only until published or discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeJobInstance {
	pub queue_name: String,
	pub data: serde_json::Value,
	pub options: PublishOptions,
}

impl OneTimeJobInstance {
	pub fn new(queue_name: impl Into<String>, data: serde_json::Value) -> OneTimeJobInstance {
		OneTimeJobInstance {
			queue_name: queue_name.into(),
			data,
			options: PublishOptions::default(),
		}
	}

	pub fn with_options(mut self, options: PublishOptions) -> OneTimeJobInstance {
		self.options = options;
		self
	}
}

#[derive(Debug, thiserror::Error)]
#[error("Job publish failed: {0}")]
pub struct PublishError(pub String);

/// Publishes job instances to the queue engine.
#[async_trait]
pub trait JobPublisher: Send + Sync {
	async fn publish(&self, instance: &OneTimeJobInstance) -> Result<(), PublishError>;
}
