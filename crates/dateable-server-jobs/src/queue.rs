// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use dateable_server_db::OneTimeJobInstance;

use crate::error::Result;
use crate::types::{JobHandler, ScheduleInfo, SubscribeOptions};

/// Storage-backed queue engine. [`crate::sqlite::SqliteQueue`] is the only
/// production implementation; tests substitute recording fakes.
#[async_trait]
pub trait QueueDriver: Send + Sync {
	/// Enqueue a job. Returns the new job id, or `None` when a singleton
	/// key deduplicated the publish.
	async fn publish(&self, instance: &OneTimeJobInstance) -> Result<Option<String>>;

	/// Start a polling worker for the queue. One subscription per queue.
	async fn subscribe(
		&self,
		queue_name: &str,
		options: SubscribeOptions,
		handler: JobHandler,
	) -> Result<()>;

	/// Stop the worker for the queue. Unknown queues are a no-op.
	async fn unsubscribe(&self, queue_name: &str) -> Result<()>;

	/// Create or update a persisted cron schedule.
	async fn schedule(&self, schedule: &ScheduleInfo) -> Result<()>;

	/// Remove a persisted cron schedule.
	async fn unschedule(&self, name: &str) -> Result<()>;

	/// All persisted cron schedules.
	async fn schedules(&self) -> Result<Vec<ScheduleInfo>>;
}
