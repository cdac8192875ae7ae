// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dateable_server_db::{
	metadata_fields, Context, ControlData, ControlType, JobPublisher, PublishOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::sqlite::SqlitePool;
use tracing::warn;

use crate::error::JobsError;
use crate::sqlite::{BASE_RETRY_DELAY_SECS, DEFAULT_RETRY_LIMIT};
use crate::types::{JobFailure, QueueJob, SubscribeOptions};

/// A unit of background work bound to one queue.
///
/// Implementations override the knobs they care about; the defaults match
/// how most jobs run: a couple of retries with exponential backoff, one job
/// in flight at a time, a fifteen-minute expiry for a worker that dies
/// mid-run.
#[async_trait]
pub trait Job: Send + Sync + 'static {
	type Data: Serialize + DeserializeOwned + Send + Sync;

	fn job_name(&self) -> &'static str;

	/// Queue this job publishes to and consumes from. One job type per
	/// queue.
	fn queue_name(&self) -> String {
		self.job_name().to_string()
	}

	fn poll_interval(&self) -> Duration {
		Duration::from_secs(2)
	}

	fn retry_limit(&self) -> u32 {
		DEFAULT_RETRY_LIMIT
	}

	fn retry_delay_secs(&self) -> u64 {
		BASE_RETRY_DELAY_SECS
	}

	fn retry_backoff(&self) -> bool {
		true
	}

	fn expire_in_minutes(&self) -> Option<u64> {
		Some(15)
	}

	/// Deduplication key for the payload. `None` disables deduplication.
	fn singleton_key(&self, _data: &Self::Data) -> Option<String> {
		None
	}

	/// Quiet window after a singleton publish during which duplicates are
	/// dropped even once the job completes.
	fn singleton_seconds(&self) -> Option<u64> {
		None
	}

	/// Jobs fetched per poll.
	fn team_size(&self) -> u32 {
		1
	}

	/// Fetched jobs executed at once.
	fn team_concurrency(&self) -> u32 {
		1
	}

	/// Extra log metadata derived from the payload.
	fn extra_metadata(&self, _data: &Self::Data) -> Map<String, Value> {
		Map::new()
	}

	async fn execute(&self, context: &Context, data: Self::Data) -> Result<(), JobsError>;

	fn publish_options(&self, data: &Self::Data) -> PublishOptions {
		PublishOptions {
			retry_limit: Some(self.retry_limit()),
			retry_delay_secs: Some(self.retry_delay_secs()),
			retry_backoff: Some(self.retry_backoff()),
			expire_in_minutes: self.expire_in_minutes(),
			singleton_key: self.singleton_key(data),
			singleton_seconds: self.singleton_seconds(),
			start_after: None,
		}
	}

	fn subscribe_options(&self) -> SubscribeOptions {
		SubscribeOptions {
			poll_interval: self.poll_interval(),
			team_size: self.team_size(),
			team_concurrency: self.team_concurrency(),
		}
	}
}

/// Run one claimed attempt inside a fresh context.
///
/// Only [`JobsError::Failed`] carries an explicit retry decision; any other
/// error (including an undeserializable payload) buries the job.
pub(crate) async fn run_job<J: Job>(
	job: &J,
	pool: SqlitePool,
	publisher: Arc<dyn JobPublisher>,
	queue_job: QueueJob,
) -> std::result::Result<(), JobFailure> {
	let data: J::Data = match serde_json::from_value(queue_job.data) {
		Ok(data) => data,
		Err(e) => {
			warn!(
				job_name = %job.job_name(),
				queue_job_id = %queue_job.id,
				error = %e,
				"job payload failed to deserialize"
			);
			return Err(JobFailure {
				message: format!("payload deserialization failed: {e}"),
				retryable: false,
			});
		}
	};

	let context = Context::create_from_parts(None, pool, publisher);
	context.add_metadata(metadata_fields(&[
		("job_name", json!(job.job_name())),
		("queue_job_id", json!(queue_job.id)),
		("retry_count", json!(queue_job.retry_count)),
	]));
	context.add_metadata(job.extra_metadata(&data));
	context.set_control_data(ControlData {
		controller_name: "jobs".to_string(),
		control_name: job.job_name().to_string(),
		control_type: ControlType::Job,
	});

	match job.execute(&context, data).await {
		Ok(()) => Ok(()),
		Err(JobsError::Failed { message, retryable }) => {
			context.logger().error_with(
				"job attempt failed",
				json!({ "error": message, "retryable": retryable }),
			);
			Err(JobFailure { message, retryable })
		}
		Err(e) => {
			let message = e.to_string();
			context.logger().error_with(
				"job attempt failed with terminal error",
				json!({ "error": message }),
			);
			Err(JobFailure {
				message,
				retryable: false,
			})
		}
	}
}

/// One-shot jobs enqueued through a request or another job's context, so a
/// publish inside a transaction is deferred until that transaction commits.
#[async_trait]
pub trait OneTimeJob: Job {
	async fn enqueue(&self, context: &Context, data: Self::Data) -> Result<(), JobsError> {
		self.enqueue_at(context, data, None).await
	}

	async fn enqueue_at(
		&self,
		context: &Context,
		data: Self::Data,
		start_after: Option<DateTime<Utc>>,
	) -> Result<(), JobsError> {
		let options = PublishOptions {
			start_after,
			..self.publish_options(&data)
		};
		let instance = dateable_server_db::OneTimeJobInstance {
			queue_name: self.queue_name(),
			data: serde_json::to_value(&data)?,
			options,
		};
		context
			.database_service()
			.enqueue_job(instance)
			.await
			.map_err(JobsError::from)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::Result;
	use dateable_server_db::testing::{create_test_pool, RecordingPublisher};
	use serde::Deserialize;

	#[derive(Serialize, Deserialize)]
	struct Payload {
		user_id: String,
	}

	struct FlakyJob {
		error: fn() -> JobsError,
	}

	#[async_trait]
	impl Job for FlakyJob {
		type Data = Payload;

		fn job_name(&self) -> &'static str {
			"flaky-job"
		}

		async fn execute(&self, _context: &Context, _data: Payload) -> Result<()> {
			Err((self.error)())
		}
	}

	fn queue_job(data: Value) -> QueueJob {
		QueueJob {
			id: "qj-1".to_string(),
			queue_name: "flaky-job".to_string(),
			data,
			retry_count: 0,
		}
	}

	#[tokio::test]
	async fn test_explicit_retryable_failure_requests_retry() {
		let pool = create_test_pool().await;
		let job = FlakyJob {
			error: || JobsError::retryable("smtp timeout"),
		};
		let failure = run_job(
			&job,
			pool,
			RecordingPublisher::new_arc(),
			queue_job(json!({"user_id": "u1"})),
		)
		.await
		.unwrap_err();
		assert!(failure.retryable);
	}

	#[tokio::test]
	async fn test_other_errors_are_terminal() {
		let pool = create_test_pool().await;
		let job = FlakyJob {
			error: || JobsError::Queue("driver exploded".to_string()),
		};
		let failure = run_job(
			&job,
			pool,
			RecordingPublisher::new_arc(),
			queue_job(json!({"user_id": "u1"})),
		)
		.await
		.unwrap_err();
		assert!(!failure.retryable);
	}

	#[tokio::test]
	async fn test_bad_payload_is_terminal() {
		let pool = create_test_pool().await;
		let job = FlakyJob {
			error: || JobsError::retryable("never reached"),
		};
		let failure = run_job(
			&job,
			pool,
			RecordingPublisher::new_arc(),
			queue_job(json!({"wrong_shape": true})),
		)
		.await
		.unwrap_err();
		assert!(!failure.retryable);
		assert!(failure.message.contains("deserialization"));
	}

	#[test]
	fn test_publish_options_carry_job_knobs() {
		struct DigestJob;

		#[async_trait]
		impl Job for DigestJob {
			type Data = Payload;

			fn job_name(&self) -> &'static str {
				"daily-digest"
			}

			fn retry_limit(&self) -> u32 {
				1
			}

			fn singleton_key(&self, data: &Payload) -> Option<String> {
				Some(data.user_id.clone())
			}

			fn singleton_seconds(&self) -> Option<u64> {
				Some(3600)
			}

			async fn execute(&self, _context: &Context, _data: Payload) -> Result<()> {
				Ok(())
			}
		}

		let options = DigestJob.publish_options(&Payload {
			user_id: "u1".to_string(),
		});
		assert_eq!(options.retry_limit, Some(1));
		assert_eq!(options.singleton_key.as_deref(), Some("u1"));
		assert_eq!(options.singleton_seconds, Some(3600));
	}
}
