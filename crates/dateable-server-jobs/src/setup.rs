// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Composition-root helper that wires the queue engine, registers every job
//! type, and installs the process-wide [`JobService`].

use std::sync::Arc;

use dateable_server_config::JobsConfig;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::cron::CronJob;
use crate::error::Result;
use crate::job::OneTimeJob;
use crate::service::JobService;
use crate::sqlite::{QueueSettings, SqliteQueue};

/// Builder over a [`JobService`] that registers jobs one by one and then
/// reconciles persisted schedules against what was registered.
pub struct JobSetup {
	service: Arc<JobService>,
	engine: Option<Arc<SqliteQueue>>,
}

impl JobSetup {
	/// Stand up a SQLite queue engine and a service on top of it. In test
	/// mode the engine is created but never started.
	pub async fn with_sqlite_queue(pool: SqlitePool, config: &JobsConfig) -> Result<JobSetup> {
		let engine = Arc::new(SqliteQueue::new(pool.clone(), QueueSettings::from(config)));
		if config.test_mode {
			engine.migrate().await?;
		} else {
			engine.start().await?;
		}
		Ok(JobSetup {
			service: JobService::new(engine.clone(), pool, config),
			engine: Some(engine),
		})
	}

	/// Wire a service over an existing driver. Tests use this with fakes.
	pub fn with_service(service: Arc<JobService>) -> JobSetup {
		JobSetup {
			service,
			engine: None,
		}
	}

	pub async fn one_time<J: OneTimeJob>(self, job: J) -> Result<JobSetup> {
		self.service.subscribe_job(job).await?;
		Ok(self)
	}

	pub async fn cron<J>(self, job: J) -> Result<JobSetup>
	where
		J: CronJob,
		J::Data: Default,
	{
		self.service.subscribe_cron_job(job).await?;
		Ok(self)
	}

	/// Reconcile schedules and install the service as the process-wide
	/// instance. Returns the service (and the engine when this setup built
	/// one) for the composition root to keep for shutdown.
	pub async fn finish(self) -> Result<(Arc<JobService>, Option<Arc<SqliteQueue>>)> {
		self.service.remove_inactive_schedules().await?;
		JobService::setup(self.service.clone())?;
		info!("job service installed");
		Ok((self.service, self.engine))
	}
}
