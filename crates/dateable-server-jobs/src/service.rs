// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide owner of the queue engine.
//!
//! One [`JobService`] is installed per process via [`JobService::setup`].
//! It subscribes job types to their queues, registers cron schedules, and
//! is the [`JobPublisher`] the database layer hands deferred jobs to after
//! a transaction commits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use dateable_server_config::JobsConfig;
use dateable_server_db::{JobPublisher, OneTimeJobInstance, PublishError};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::cron::CronJob;
use crate::error::{JobsError, Result};
use crate::job::{run_job, Job};
use crate::queue::QueueDriver;
use crate::types::JobHandler;

static INSTANCE: OnceLock<Arc<JobService>> = OnceLock::new();

pub struct JobService {
	driver: Arc<dyn QueueDriver>,
	pool: SqlitePool,
	run_jobs: bool,
	test_mode: bool,
	subscribed: Mutex<Vec<String>>,
	scheduled: Mutex<Vec<String>>,
	stopped: AtomicBool,
}

impl JobService {
	pub fn new(driver: Arc<dyn QueueDriver>, pool: SqlitePool, config: &JobsConfig) -> Arc<JobService> {
		Arc::new(JobService {
			driver,
			pool,
			run_jobs: config.run_jobs,
			test_mode: config.test_mode,
			subscribed: Mutex::new(Vec::new()),
			scheduled: Mutex::new(Vec::new()),
			stopped: AtomicBool::new(false),
		})
	}

	/// Install the process-wide instance. Fails if called twice.
	pub fn setup(service: Arc<JobService>) -> Result<()> {
		INSTANCE
			.set(service)
			.map_err(|_| JobsError::AlreadyInitialized)
	}

	/// The installed instance. Fails until [`JobService::setup`] runs.
	pub fn instance() -> Result<Arc<JobService>> {
		INSTANCE.get().cloned().ok_or(JobsError::NotInitialized)
	}

	/// Start a worker consuming the job's queue. No-op when job running is
	/// disabled (API-only deployments still publish).
	pub async fn subscribe_job<J: Job>(self: &Arc<Self>, job: J) -> Result<()> {
		let queue_name = job.queue_name();
		{
			let mut subscribed = self.subscribed.lock().expect("subscriptions poisoned");
			if subscribed.contains(&queue_name) {
				return Err(JobsError::Queue(format!(
					"job queue '{queue_name}' registered twice"
				)));
			}
			subscribed.push(queue_name.clone());
		}
		if !self.run_jobs || self.test_mode {
			debug!(queue_name = %queue_name, "job running disabled, not subscribing");
			return Ok(());
		}

		let options = job.subscribe_options();
		let handler = handler_for(Arc::new(job), self.pool.clone(), self.clone());
		self.driver.subscribe(&queue_name, options, handler).await
	}

	/// Register the cron schedule and start a worker for its queue.
	pub async fn subscribe_cron_job<J>(self: &Arc<Self>, job: J) -> Result<()>
	where
		J: CronJob,
		J::Data: Default,
	{
		let info = job.schedule_info()?;
		if self.run_jobs && !self.test_mode {
			self.driver.schedule(&info).await?;
		}
		self.scheduled
			.lock()
			.expect("schedules poisoned")
			.push(info.name);
		self.subscribe_job(job).await
	}

	/// Drop persisted schedules that no registered cron job claims, so
	/// renamed or deleted jobs stop firing after a deploy.
	pub async fn remove_inactive_schedules(&self) -> Result<()> {
		if !self.run_jobs {
			return Ok(());
		}
		let active = self.scheduled.lock().expect("schedules poisoned").clone();
		for schedule in self.driver.schedules().await? {
			if !active.contains(&schedule.name) {
				info!(schedule = %schedule.name, "removing inactive schedule");
				self.driver.unschedule(&schedule.name).await?;
			}
		}
		Ok(())
	}

	/// Publish directly to the queue. In test mode this is a no-op so unit
	/// tests never run real workers.
	pub async fn publish_job(&self, instance: &OneTimeJobInstance) -> Result<Option<String>> {
		if self.test_mode {
			debug!(queue_name = %instance.queue_name, "test mode, dropping publish");
			return Ok(None);
		}
		self.driver.publish(instance).await
	}

	/// Stop consuming from every subscribed queue. Idempotent; in-flight
	/// jobs finish their current attempt. Publishing remains possible.
	pub async fn stop(&self) {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return;
		}
		let queues = std::mem::take(&mut *self.subscribed.lock().expect("subscriptions poisoned"));
		for queue_name in queues {
			if let Err(e) = self.driver.unsubscribe(&queue_name).await {
				warn!(queue_name = %queue_name, error = %e, "failed to unsubscribe queue");
			}
		}
		info!("job service stopped");
	}
}

#[async_trait]
impl JobPublisher for JobService {
	async fn publish(&self, instance: &OneTimeJobInstance) -> std::result::Result<(), PublishError> {
		self.publish_job(instance)
			.await
			.map(|_| ())
			.map_err(|e| PublishError(e.to_string()))
	}
}

fn handler_for<J: Job>(job: Arc<J>, pool: SqlitePool, service: Arc<JobService>) -> JobHandler {
	Arc::new(move |queue_job| {
		let job = job.clone();
		let pool = pool.clone();
		let publisher: Arc<dyn JobPublisher> = service.clone();
		Box::pin(async move { run_job(job.as_ref(), pool, publisher, queue_job).await })
	})
}
