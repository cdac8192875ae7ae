// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite-backed queue engine.
//!
//! Jobs live in `queue_jobs` and move through
//! created -> active -> {completed | failed | expired}. Workers poll their
//! queue, claim a batch with `UPDATE ... RETURNING`, and run claimed jobs
//! with bounded concurrency. A maintenance task fires due cron schedules,
//! expires stuck active jobs, and prunes finished rows.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dateable_server_config::JobsConfig;
use dateable_server_db::OneTimeJobInstance;
use futures::StreamExt;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::queue::QueueDriver;
use crate::types::{JobHandler, QueueJob, ScheduleInfo, SubscribeOptions};

pub(crate) const DEFAULT_RETRY_LIMIT: u32 = 3;
pub(crate) const BASE_RETRY_DELAY_SECS: u64 = 1;
const MAX_RETRY_DELAY_SECS: u64 = 60;
const RETRY_FACTOR: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct QueueSettings {
	pub schedule_tick: Duration,
	pub completed_retention: Duration,
}

impl From<&JobsConfig> for QueueSettings {
	fn from(config: &JobsConfig) -> QueueSettings {
		QueueSettings {
			schedule_tick: Duration::from_secs(config.schedule_tick_secs),
			completed_retention: Duration::from_secs(config.completed_retention_hours * 3600),
		}
	}
}

struct Subscription {
	cancelled: Arc<AtomicBool>,
	cancel: Arc<Notify>,
	handle: JoinHandle<()>,
}

pub struct SqliteQueue {
	pool: SqlitePool,
	settings: QueueSettings,
	subscriptions: Mutex<HashMap<String, Subscription>>,
	shutdown_tx: broadcast::Sender<()>,
	maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A claimed job row with everything needed to settle the attempt.
#[derive(Debug)]
struct ClaimedJob {
	id: String,
	data: String,
	retry_count: u32,
	retry_limit: u32,
	retry_delay_secs: u64,
	retry_backoff: bool,
}

fn now_str() -> String {
	format_time(Utc::now())
}

fn format_time(time: DateTime<Utc>) -> String {
	// Nanosecond RFC 3339 in UTC sorts lexicographically.
	time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(text)
		.map(|t| t.with_timezone(&Utc))
		.map_err(|e| JobsError::Queue(format!("invalid timestamp '{text}': {e}")))
}

/// Exponential backoff for attempt `retry_count` (1-based), with jitter so
/// retrying jobs on one queue do not wake in lockstep.
pub(crate) fn retry_delay(base_secs: u64, backoff: bool, retry_count: u32) -> Duration {
	let delay = if backoff {
		let scaled = base_secs as f64 * RETRY_FACTOR.powi(retry_count.saturating_sub(1) as i32);
		(scaled as u64).min(MAX_RETRY_DELAY_SECS)
	} else {
		base_secs
	};
	let jitter_ms = fastrand::u64(0..=delay.saturating_mul(250));
	Duration::from_secs(delay) + Duration::from_millis(jitter_ms)
}

/// Whether a cron schedule has a fire time in `(after, now]`.
pub(crate) fn schedule_is_due(
	expression: &str,
	after: DateTime<Utc>,
	now: DateTime<Utc>,
) -> Result<bool> {
	let schedule = cron::Schedule::from_str(expression).map_err(|source| JobsError::InvalidCron {
		expression: expression.to_string(),
		source,
	})?;
	Ok(schedule.after(&after).next().is_some_and(|fire| fire <= now))
}

impl SqliteQueue {
	pub fn new(pool: SqlitePool, settings: QueueSettings) -> SqliteQueue {
		let (shutdown_tx, _) = broadcast::channel(1);
		SqliteQueue {
			pool,
			settings,
			subscriptions: Mutex::new(HashMap::new()),
			shutdown_tx,
			maintenance: Mutex::new(None),
		}
	}

	/// Create tables and start the maintenance loop.
	#[tracing::instrument(skip(self))]
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		self.migrate().await?;

		let queue = Arc::clone(self);
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let tick = self.settings.schedule_tick;
		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(tick) => {
						queue.run_maintenance().await;
					}
					_ = shutdown_rx.recv() => {
						break;
					}
				}
			}
		});
		*self.maintenance.lock().await = Some(handle);

		info!("queue engine started");
		Ok(())
	}

	/// Stop the maintenance loop and every worker.
	#[tracing::instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());

		if let Some(handle) = self.maintenance.lock().await.take() {
			let _ = handle.await;
		}
		let mut subscriptions = self.subscriptions.lock().await;
		for (queue_name, subscription) in subscriptions.drain() {
			subscription.cancelled.store(true, Ordering::SeqCst);
			let _ = subscription.handle.await;
			debug!(queue_name = %queue_name, "worker stopped");
		}

		info!("queue engine shut down");
	}

	pub async fn migrate(&self) -> Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS queue_jobs (
				id TEXT PRIMARY KEY,
				queue_name TEXT NOT NULL,
				state TEXT NOT NULL,
				data TEXT NOT NULL,
				retry_limit INTEGER NOT NULL,
				retry_count INTEGER NOT NULL DEFAULT 0,
				retry_delay_secs INTEGER NOT NULL,
				retry_backoff INTEGER NOT NULL,
				expire_in_minutes INTEGER,
				singleton_key TEXT,
				singleton_until TEXT,
				start_after TEXT,
				started_at TEXT,
				completed_at TEXT,
				output TEXT,
				created_at TEXT NOT NULL
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_queue_jobs_fetch \
			 ON queue_jobs (queue_name, state, start_after)",
		)
		.execute(&self.pool)
		.await?;

		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS queue_schedules (
				name TEXT PRIMARY KEY,
				cron TEXT NOT NULL,
				timezone TEXT NOT NULL,
				data TEXT NOT NULL,
				options TEXT NOT NULL,
				last_fired_at TEXT,
				updated_at TEXT NOT NULL
			)
			"#,
		)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	pub(crate) async fn run_maintenance(&self) {
		if let Err(e) = self.fire_due_schedules().await {
			warn!(error = %e, "failed to fire due schedules");
		}
		if let Err(e) = self.expire_stale_jobs().await {
			warn!(error = %e, "failed to expire stale jobs");
		}
		if let Err(e) = self.prune_finished_jobs().await {
			warn!(error = %e, "failed to prune finished jobs");
		}
	}

	async fn claim_batch(&self, queue_name: &str, limit: u32) -> Result<Vec<ClaimedJob>> {
		let now = now_str();
		let rows = sqlx::query(
			r#"
			UPDATE queue_jobs SET state = 'active', started_at = ?1
			WHERE id IN (
				SELECT id FROM queue_jobs
				WHERE queue_name = ?2 AND state = 'created'
					AND (start_after IS NULL OR start_after <= ?1)
				ORDER BY created_at
				LIMIT ?3
			)
			RETURNING id, data, retry_count, retry_limit, retry_delay_secs, retry_backoff
			"#,
		)
		.bind(&now)
		.bind(queue_name)
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter()
			.map(|row| {
				Ok(ClaimedJob {
					id: row.try_get("id")?,
					data: row.try_get("data")?,
					retry_count: row.try_get::<i64, _>("retry_count")? as u32,
					retry_limit: row.try_get::<i64, _>("retry_limit")? as u32,
					retry_delay_secs: row.try_get::<i64, _>("retry_delay_secs")? as u64,
					retry_backoff: row.try_get::<i64, _>("retry_backoff")? != 0,
				})
			})
			.collect()
	}

	async fn complete_job(&self, id: &str) -> Result<()> {
		sqlx::query("UPDATE queue_jobs SET state = 'completed', completed_at = ? WHERE id = ?")
			.bind(now_str())
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Settle a failed attempt: reschedule with backoff when the failure is
	/// retryable and attempts remain, otherwise mark the job failed.
	async fn fail_job(&self, job: &ClaimedJob, message: &str, retryable: bool) -> Result<()> {
		if retryable && job.retry_count < job.retry_limit {
			let next_attempt = job.retry_count + 1;
			let delay = retry_delay(job.retry_delay_secs, job.retry_backoff, next_attempt);
			let start_after = format_time(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
			sqlx::query(
				"UPDATE queue_jobs SET state = 'created', retry_count = ?, \
				 start_after = ?, started_at = NULL, output = ? WHERE id = ?",
			)
			.bind(next_attempt)
			.bind(&start_after)
			.bind(message)
			.bind(&job.id)
			.execute(&self.pool)
			.await?;
			debug!(job_id = %job.id, retry_count = next_attempt, start_after = %start_after, "job rescheduled");
		} else {
			sqlx::query(
				"UPDATE queue_jobs SET state = 'failed', completed_at = ?, output = ? WHERE id = ?",
			)
			.bind(now_str())
			.bind(message)
			.bind(&job.id)
			.execute(&self.pool)
			.await?;
			warn!(job_id = %job.id, error = %message, "job failed terminally");
		}
		Ok(())
	}

	async fn run_claimed(&self, queue_name: &str, jobs: Vec<ClaimedJob>, handler: &JobHandler, concurrency: u32) {
		futures::stream::iter(jobs)
			.for_each_concurrent(concurrency.max(1) as usize, |job| {
				let handler = handler.clone();
				async move {
					let data = match serde_json::from_str(&job.data) {
						Ok(value) => value,
						Err(e) => {
							// A payload we stored but can no longer parse
							// is never going to improve with retries.
							let _ = self
								.fail_job(&job, &format!("invalid payload: {e}"), false)
								.await;
							return;
						}
					};
					let queue_job = QueueJob {
						id: job.id.clone(),
						queue_name: queue_name.to_string(),
						data,
						retry_count: job.retry_count,
					};
					let outcome = handler(queue_job).await;
					let result = match outcome {
						Ok(()) => self.complete_job(&job.id).await,
						Err(failure) => {
							self.fail_job(&job, &failure.message, failure.retryable).await
						}
					};
					if let Err(e) = result {
						warn!(job_id = %job.id, error = %e, "failed to settle job attempt");
					}
				}
			})
			.await;
	}

	async fn fire_due_schedules(&self) -> Result<()> {
		let now = Utc::now();
		let rows = sqlx::query(
			"SELECT name, cron, timezone, data, options, last_fired_at FROM queue_schedules",
		)
		.fetch_all(&self.pool)
		.await?;

		for row in rows {
			let name: String = row.try_get("name")?;
			let expression: String = row.try_get("cron")?;
			let last_fired_at: Option<String> = row.try_get("last_fired_at")?;
			let after = match &last_fired_at {
				Some(text) => parse_time(text)?,
				// Never fired: look back one tick so a just-created
				// schedule does not replay history.
				None => now - chrono::Duration::from_std(self.settings.schedule_tick).unwrap_or_default(),
			};

			match schedule_is_due(&expression, after, now) {
				Ok(false) => continue,
				Ok(true) => {}
				Err(e) => {
					warn!(schedule = %name, error = %e, "skipping schedule with invalid cron");
					continue;
				}
			}

			let data: String = row.try_get("data")?;
			let options: String = row.try_get("options")?;
			let instance = OneTimeJobInstance {
				queue_name: name.clone(),
				data: serde_json::from_str(&data)?,
				options: serde_json::from_str(&options)?,
			};
			match self.publish(&instance).await {
				Ok(Some(job_id)) => {
					info!(schedule = %name, job_id = %job_id, "schedule fired");
				}
				Ok(None) => {
					debug!(schedule = %name, "schedule fire deduplicated");
				}
				Err(e) => {
					warn!(schedule = %name, error = %e, "failed to publish scheduled job");
					continue;
				}
			}
			sqlx::query("UPDATE queue_schedules SET last_fired_at = ? WHERE name = ?")
				.bind(format_time(now))
				.bind(&name)
				.execute(&self.pool)
				.await?;
		}
		Ok(())
	}

	/// Move active jobs past their expiry window to `expired`. A worker
	/// that died mid-job leaves its row active forever otherwise.
	async fn expire_stale_jobs(&self) -> Result<()> {
		let now = Utc::now();
		let rows = sqlx::query(
			"SELECT id, started_at, expire_in_minutes FROM queue_jobs \
			 WHERE state = 'active' AND expire_in_minutes IS NOT NULL",
		)
		.fetch_all(&self.pool)
		.await?;

		for row in rows {
			let id: String = row.try_get("id")?;
			let started_at: Option<String> = row.try_get("started_at")?;
			let expire_in_minutes: i64 = row.try_get("expire_in_minutes")?;
			let Some(started_at) = started_at else {
				continue;
			};
			let deadline = parse_time(&started_at)? + chrono::Duration::minutes(expire_in_minutes);
			if deadline <= now {
				sqlx::query(
					"UPDATE queue_jobs SET state = 'expired', completed_at = ? \
					 WHERE id = ? AND state = 'active'",
				)
				.bind(now_str())
				.bind(&id)
				.execute(&self.pool)
				.await?;
				warn!(job_id = %id, "active job expired");
			}
		}
		Ok(())
	}

	async fn prune_finished_jobs(&self) -> Result<()> {
		let cutoff = Utc::now()
			- chrono::Duration::from_std(self.settings.completed_retention).unwrap_or_default();
		let pruned = sqlx::query(
			"DELETE FROM queue_jobs \
			 WHERE state IN ('completed', 'expired', 'failed') AND completed_at < ?",
		)
		.bind(format_time(cutoff))
		.execute(&self.pool)
		.await?
		.rows_affected();
		if pruned > 0 {
			debug!(pruned, "pruned finished jobs");
		}
		Ok(())
	}
}

#[async_trait]
impl QueueDriver for SqliteQueue {
	async fn publish(&self, instance: &OneTimeJobInstance) -> Result<Option<String>> {
		let now = Utc::now();
		let options = &instance.options;

		if let Some(key) = &options.singleton_key {
			// One queued-or-running job per key, plus an optional quiet
			// window that survives completion (and restarts, since it is
			// persisted on the row).
			let existing: Option<(String,)> = sqlx::query_as(
				"SELECT id FROM queue_jobs \
				 WHERE queue_name = ? AND singleton_key = ? \
					AND (state IN ('created', 'active') \
						OR (singleton_until IS NOT NULL AND singleton_until > ?)) \
				 LIMIT 1",
			)
			.bind(&instance.queue_name)
			.bind(key)
			.bind(format_time(now))
			.fetch_optional(&self.pool)
			.await?;
			if let Some((existing_id,)) = existing {
				debug!(
					queue_name = %instance.queue_name,
					singleton_key = %key,
					existing_id = %existing_id,
					"publish deduplicated by singleton key"
				);
				return Ok(None);
			}
		}

		let id = Uuid::new_v4().to_string();
		let singleton_until = options
			.singleton_seconds
			.map(|secs| format_time(now + chrono::Duration::seconds(secs as i64)));
		sqlx::query(
			r#"
			INSERT INTO queue_jobs (
				id, queue_name, state, data,
				retry_limit, retry_count, retry_delay_secs, retry_backoff,
				expire_in_minutes, singleton_key, singleton_until,
				start_after, created_at
			)
			VALUES (?, ?, 'created', ?, ?, 0, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(&id)
		.bind(&instance.queue_name)
		.bind(serde_json::to_string(&instance.data)?)
		.bind(options.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT))
		.bind(options.retry_delay_secs.unwrap_or(BASE_RETRY_DELAY_SECS) as i64)
		.bind(options.retry_backoff.unwrap_or(true))
		.bind(options.expire_in_minutes.map(|m| m as i64))
		.bind(&options.singleton_key)
		.bind(&singleton_until)
		.bind(options.start_after.map(format_time))
		.bind(format_time(now))
		.execute(&self.pool)
		.await?;

		debug!(queue_name = %instance.queue_name, job_id = %id, "job published");
		Ok(Some(id))
	}

	async fn subscribe(
		&self,
		queue_name: &str,
		options: SubscribeOptions,
		handler: JobHandler,
	) -> Result<()> {
		let mut subscriptions = self.subscriptions.lock().await;
		if subscriptions.contains_key(queue_name) {
			return Err(JobsError::Queue(format!(
				"queue '{queue_name}' already has a subscription"
			)));
		}

		let cancelled = Arc::new(AtomicBool::new(false));
		let cancel = Arc::new(Notify::new());
		let worker_cancelled = cancelled.clone();
		let worker_cancel = cancel.clone();
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let pool = self.pool.clone();
		let settings = self.settings.clone();
		let worker_queue = queue_name.to_string();

		// The worker owns a private view of the queue so it keeps running
		// after the registry entry is dropped on unsubscribe.
		let queue = SqliteQueue::new(pool, settings);
		let handle = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(options.poll_interval) => {
						if worker_cancelled.load(Ordering::SeqCst) {
							break;
						}
						let batch = match queue.claim_batch(&worker_queue, options.team_size).await {
							Ok(batch) => batch,
							Err(e) => {
								warn!(queue_name = %worker_queue, error = %e, "failed to claim jobs");
								continue;
							}
						};
						if !batch.is_empty() {
							queue
								.run_claimed(&worker_queue, batch, &handler, options.team_concurrency)
								.await;
						}
					}
					// Cancellation interrupts the poll sleep, never a
					// running attempt.
					_ = worker_cancel.notified() => {
						break;
					}
					_ = shutdown_rx.recv() => {
						break;
					}
				}
			}
			debug!(queue_name = %worker_queue, "worker loop exited");
		});

		subscriptions.insert(
			queue_name.to_string(),
			Subscription {
				cancelled,
				cancel,
				handle,
			},
		);
		info!(queue_name = %queue_name, "queue subscribed");
		Ok(())
	}

	async fn unsubscribe(&self, queue_name: &str) -> Result<()> {
		let subscription = self.subscriptions.lock().await.remove(queue_name);
		if let Some(subscription) = subscription {
			subscription.cancelled.store(true, Ordering::SeqCst);
			subscription.cancel.notify_one();
			let _ = subscription.handle.await;
			info!(queue_name = %queue_name, "queue unsubscribed");
		}
		Ok(())
	}

	async fn schedule(&self, schedule: &ScheduleInfo) -> Result<()> {
		// Validate before persisting; a bad expression would otherwise wedge
		// the maintenance loop with warnings forever.
		cron::Schedule::from_str(&schedule.cron).map_err(|source| JobsError::InvalidCron {
			expression: schedule.cron.clone(),
			source,
		})?;
		sqlx::query(
			r#"
			INSERT INTO queue_schedules (name, cron, timezone, data, options, updated_at)
			VALUES (?, ?, ?, ?, ?, ?)
			ON CONFLICT(name) DO UPDATE SET
				cron = excluded.cron,
				timezone = excluded.timezone,
				data = excluded.data,
				options = excluded.options,
				updated_at = excluded.updated_at
			"#,
		)
		.bind(&schedule.name)
		.bind(&schedule.cron)
		.bind(&schedule.timezone)
		.bind(serde_json::to_string(&schedule.data)?)
		.bind(serde_json::to_string(&schedule.options)?)
		.bind(now_str())
		.execute(&self.pool)
		.await?;
		info!(schedule = %schedule.name, cron = %schedule.cron, "schedule upserted");
		Ok(())
	}

	async fn unschedule(&self, name: &str) -> Result<()> {
		sqlx::query("DELETE FROM queue_schedules WHERE name = ?")
			.bind(name)
			.execute(&self.pool)
			.await?;
		info!(schedule = %name, "schedule removed");
		Ok(())
	}

	async fn schedules(&self) -> Result<Vec<ScheduleInfo>> {
		let rows =
			sqlx::query("SELECT name, cron, timezone, data, options FROM queue_schedules")
				.fetch_all(&self.pool)
				.await?;
		rows.into_iter()
			.map(|row| {
				Ok(ScheduleInfo {
					name: row.try_get("name")?,
					cron: row.try_get("cron")?,
					timezone: row.try_get("timezone")?,
					data: serde_json::from_str(&row.try_get::<String, _>("data")?)?,
					options: serde_json::from_str(&row.try_get::<String, _>("options")?)?,
				})
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dateable_server_db::testing::create_test_pool;
	use dateable_server_db::PublishOptions;
	use serde_json::json;
	use std::sync::atomic::AtomicUsize;

	async fn test_queue() -> Arc<SqliteQueue> {
		let pool = create_test_pool().await;
		let queue = Arc::new(SqliteQueue::new(
			pool,
			QueueSettings {
				schedule_tick: Duration::from_secs(60),
				completed_retention: Duration::from_secs(2 * 3600),
			},
		));
		queue.migrate().await.unwrap();
		queue
	}

	async fn job_state(queue: &SqliteQueue, id: &str) -> String {
		let (state,): (String,) = sqlx::query_as("SELECT state FROM queue_jobs WHERE id = ?")
			.bind(id)
			.fetch_one(&queue.pool)
			.await
			.unwrap();
		state
	}

	#[tokio::test]
	async fn test_publish_claim_complete_cycle() {
		let queue = test_queue().await;
		let id = queue
			.publish(&OneTimeJobInstance::new("emails", json!({"user_id": "u1"})))
			.await
			.unwrap()
			.unwrap();

		let batch = queue.claim_batch("emails", 10).await.unwrap();
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].id, id);
		assert_eq!(job_state(&queue, &id).await, "active");

		// A second claim finds nothing while the job is active.
		assert!(queue.claim_batch("emails", 10).await.unwrap().is_empty());

		queue.complete_job(&id).await.unwrap();
		assert_eq!(job_state(&queue, &id).await, "completed");
	}

	#[tokio::test]
	async fn test_start_after_defers_claim() {
		let queue = test_queue().await;
		let instance = OneTimeJobInstance::new("emails", json!({})).with_options(PublishOptions {
			start_after: Some(Utc::now() + chrono::Duration::hours(1)),
			..PublishOptions::default()
		});
		queue.publish(&instance).await.unwrap().unwrap();
		assert!(queue.claim_batch("emails", 10).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_retryable_failure_reschedules_until_limit() {
		let queue = test_queue().await;
		let instance = OneTimeJobInstance::new("emails", json!({})).with_options(PublishOptions {
			retry_limit: Some(1),
			retry_delay_secs: Some(0),
			retry_backoff: Some(false),
			..PublishOptions::default()
		});
		let id = queue.publish(&instance).await.unwrap().unwrap();

		let job = queue.claim_batch("emails", 1).await.unwrap().remove(0);
		queue.fail_job(&job, "transient", true).await.unwrap();
		assert_eq!(job_state(&queue, &id).await, "created");

		// Second attempt exhausts the limit.
		tokio::time::sleep(Duration::from_millis(50)).await;
		let job = queue.claim_batch("emails", 1).await.unwrap().remove(0);
		assert_eq!(job.retry_count, 1);
		queue.fail_job(&job, "transient again", true).await.unwrap();
		assert_eq!(job_state(&queue, &id).await, "failed");
	}

	#[tokio::test]
	async fn test_terminal_failure_never_reschedules() {
		let queue = test_queue().await;
		let id = queue
			.publish(&OneTimeJobInstance::new("emails", json!({})))
			.await
			.unwrap()
			.unwrap();
		let job = queue.claim_batch("emails", 1).await.unwrap().remove(0);
		queue.fail_job(&job, "bad payload", false).await.unwrap();
		assert_eq!(job_state(&queue, &id).await, "failed");
	}

	#[tokio::test]
	async fn test_singleton_key_deduplicates_while_queued() {
		let queue = test_queue().await;
		let instance = OneTimeJobInstance::new("digest", json!({})).with_options(PublishOptions {
			singleton_key: Some("u1".to_string()),
			..PublishOptions::default()
		});
		assert!(queue.publish(&instance).await.unwrap().is_some());
		assert!(queue.publish(&instance).await.unwrap().is_none());

		// Completing the job releases the key when no window is set.
		let job = queue.claim_batch("digest", 1).await.unwrap().remove(0);
		queue.complete_job(&job.id).await.unwrap();
		assert!(queue.publish(&instance).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn test_singleton_window_outlives_completion() {
		let queue = test_queue().await;
		let instance = OneTimeJobInstance::new("digest", json!({})).with_options(PublishOptions {
			singleton_key: Some("u1".to_string()),
			singleton_seconds: Some(3600),
			..PublishOptions::default()
		});
		let id = queue.publish(&instance).await.unwrap().unwrap();
		queue.complete_job(&id).await.unwrap();
		assert!(queue.publish(&instance).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_expire_stale_active_jobs() {
		let queue = test_queue().await;
		let instance = OneTimeJobInstance::new("slow", json!({})).with_options(PublishOptions {
			expire_in_minutes: Some(15),
			..PublishOptions::default()
		});
		let id = queue.publish(&instance).await.unwrap().unwrap();
		queue.claim_batch("slow", 1).await.unwrap();

		// Backdate the claim past the expiry window.
		sqlx::query("UPDATE queue_jobs SET started_at = ? WHERE id = ?")
			.bind(format_time(Utc::now() - chrono::Duration::minutes(16)))
			.bind(&id)
			.execute(&queue.pool)
			.await
			.unwrap();

		queue.expire_stale_jobs().await.unwrap();
		assert_eq!(job_state(&queue, &id).await, "expired");
	}

	#[tokio::test]
	async fn test_prune_removes_old_finished_jobs() {
		let queue = test_queue().await;
		let id = queue
			.publish(&OneTimeJobInstance::new("emails", json!({})))
			.await
			.unwrap()
			.unwrap();
		queue.complete_job(&id).await.unwrap();
		sqlx::query("UPDATE queue_jobs SET completed_at = ? WHERE id = ?")
			.bind(format_time(Utc::now() - chrono::Duration::hours(3)))
			.bind(&id)
			.execute(&queue.pool)
			.await
			.unwrap();

		queue.prune_finished_jobs().await.unwrap();
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_jobs")
			.fetch_one(&queue.pool)
			.await
			.unwrap();
		assert_eq!(count, 0);
	}

	#[tokio::test]
	async fn test_worker_executes_published_job() {
		let queue = test_queue().await;
		let executed = Arc::new(AtomicUsize::new(0));
		let counter = executed.clone();
		let handler: JobHandler = Arc::new(move |job: QueueJob| {
			let counter = counter.clone();
			Box::pin(async move {
				assert_eq!(job.data, json!({"n": 1}));
				counter.fetch_add(1, Ordering::SeqCst);
				Ok(())
			})
		});
		queue
			.subscribe(
				"fast",
				SubscribeOptions {
					poll_interval: Duration::from_millis(20),
					..SubscribeOptions::default()
				},
				handler,
			)
			.await
			.unwrap();

		let id = queue
			.publish(&OneTimeJobInstance::new("fast", json!({"n": 1})))
			.await
			.unwrap()
			.unwrap();

		for _ in 0..100 {
			if job_state(&queue, &id).await == "completed" {
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert_eq!(job_state(&queue, &id).await, "completed");
		assert_eq!(executed.load(Ordering::SeqCst), 1);
		queue.shutdown().await;
	}

	#[tokio::test]
	async fn test_unsubscribe_returns_promptly_despite_long_poll_interval() {
		let queue = test_queue().await;
		let handler: JobHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
		queue
			.subscribe(
				"slow-poll",
				SubscribeOptions {
					poll_interval: Duration::from_secs(3600),
					..SubscribeOptions::default()
				},
				handler,
			)
			.await
			.unwrap();

		let started = std::time::Instant::now();
		queue.unsubscribe("slow-poll").await.unwrap();
		assert!(started.elapsed() < Duration::from_secs(1));
	}

	#[tokio::test]
	async fn test_duplicate_subscription_is_rejected() {
		let queue = test_queue().await;
		let handler: JobHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
		queue
			.subscribe("q", SubscribeOptions::default(), handler.clone())
			.await
			.unwrap();
		let err = queue
			.subscribe("q", SubscribeOptions::default(), handler)
			.await
			.unwrap_err();
		assert!(matches!(err, JobsError::Queue(_)));
		queue.shutdown().await;
	}

	#[tokio::test]
	async fn test_schedule_roundtrip_and_unschedule() {
		let queue = test_queue().await;
		let schedule = ScheduleInfo {
			name: "daily-digest".to_string(),
			cron: "0 0 9 * * *".to_string(),
			timezone: "UTC".to_string(),
			data: json!({}),
			options: PublishOptions::default(),
		};
		queue.schedule(&schedule).await.unwrap();
		let listed = queue.schedules().await.unwrap();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].name, "daily-digest");
		assert_eq!(listed[0].cron, "0 0 9 * * *");

		queue.unschedule("daily-digest").await.unwrap();
		assert!(queue.schedules().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_invalid_cron_is_rejected_on_schedule() {
		let queue = test_queue().await;
		let schedule = ScheduleInfo {
			name: "broken".to_string(),
			cron: "not a cron".to_string(),
			timezone: "UTC".to_string(),
			data: json!({}),
			options: PublishOptions::default(),
		};
		let err = queue.schedule(&schedule).await.unwrap_err();
		assert!(matches!(err, JobsError::InvalidCron { .. }));
	}

	#[tokio::test]
	async fn test_due_schedule_publishes_exactly_once() {
		let queue = test_queue().await;
		let schedule = ScheduleInfo {
			// Every second, so a fire time always lands in the window.
			name: "ticker".to_string(),
			cron: "* * * * * *".to_string(),
			timezone: "UTC".to_string(),
			data: json!({"source": "cron"}),
			options: PublishOptions::default(),
		};
		queue.schedule(&schedule).await.unwrap();
		queue.fire_due_schedules().await.unwrap();

		let (count,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM queue_jobs WHERE queue_name = 'ticker'")
				.fetch_one(&queue.pool)
				.await
				.unwrap();
		assert_eq!(count, 1);
	}

	#[test]
	fn test_schedule_is_due_windows() {
		let t0 = DateTime::parse_from_rfc3339("2026-08-01T08:59:00Z")
			.unwrap()
			.with_timezone(&Utc);
		let t1 = DateTime::parse_from_rfc3339("2026-08-01T09:01:00Z")
			.unwrap()
			.with_timezone(&Utc);
		// 09:00 daily falls inside (08:59, 09:01].
		assert!(schedule_is_due("0 0 9 * * *", t0, t1).unwrap());
		// Nothing due in a one-minute window before 09:00.
		let t2 = DateTime::parse_from_rfc3339("2026-08-01T08:58:00Z")
			.unwrap()
			.with_timezone(&Utc);
		assert!(!schedule_is_due("0 0 9 * * *", t2, t0).unwrap());
		assert!(schedule_is_due("bogus", t0, t1).is_err());
	}

	#[test]
	fn test_retry_delay_backoff_caps_at_max() {
		let first = retry_delay(1, true, 1);
		assert!(first >= Duration::from_secs(1) && first < Duration::from_secs(2));
		let capped = retry_delay(1, true, 30);
		assert!(capped >= Duration::from_secs(60));
		assert!(capped <= Duration::from_secs(60) + Duration::from_millis(15_000));
		let flat = retry_delay(5, false, 4);
		assert!(flat >= Duration::from_secs(5));
	}
}
