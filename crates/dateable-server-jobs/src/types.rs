// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use std::time::Duration;

use dateable_server_db::PublishOptions;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a queued job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	Created,
	Active,
	Completed,
	Failed,
	Expired,
}

impl JobState {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobState::Created => "created",
			JobState::Active => "active",
			JobState::Completed => "completed",
			JobState::Failed => "failed",
			JobState::Expired => "expired",
		}
	}
}

impl std::str::FromStr for JobState {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<JobState, String> {
		match s {
			"created" => Ok(JobState::Created),
			"active" => Ok(JobState::Active),
			"completed" => Ok(JobState::Completed),
			"failed" => Ok(JobState::Failed),
			"expired" => Ok(JobState::Expired),
			other => Err(format!("unknown job state: {other}")),
		}
	}
}

/// A job handed to a subscription handler by the queue driver.
#[derive(Debug, Clone)]
pub struct QueueJob {
	pub id: String,
	pub queue_name: String,
	pub data: Value,
	pub retry_count: u32,
}

/// How a worker pulls jobs off its queue.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
	pub poll_interval: Duration,
	/// Jobs fetched per poll.
	pub team_size: u32,
	/// Fetched jobs executed at once.
	pub team_concurrency: u32,
}

impl Default for SubscribeOptions {
	fn default() -> SubscribeOptions {
		SubscribeOptions {
			poll_interval: Duration::from_secs(2),
			team_size: 1,
			team_concurrency: 1,
		}
	}
}

/// A persisted cron schedule that publishes a job when due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInfo {
	/// Schedule name, also the target queue name.
	pub name: String,
	pub cron: String,
	pub timezone: String,
	pub data: Value,
	pub options: PublishOptions,
}

/// Handler outcome when a job attempt fails. `retryable` is the driver's
/// retry-vs-bury decision.
#[derive(Debug, Clone)]
pub struct JobFailure {
	pub message: String,
	pub retryable: bool,
}

pub type JobHandler = Arc<
	dyn Fn(QueueJob) -> BoxFuture<'static, std::result::Result<(), JobFailure>> + Send + Sync,
>;

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn test_job_state_round_trips_through_str() {
		for state in [
			JobState::Created,
			JobState::Active,
			JobState::Completed,
			JobState::Failed,
			JobState::Expired,
		] {
			assert_eq!(JobState::from_str(state.as_str()).unwrap(), state);
		}
		assert!(JobState::from_str("bogus").is_err());
	}
}
