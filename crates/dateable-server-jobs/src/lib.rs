// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background job queue for the Dateable server.
//!
//! Jobs are published onto named queues persisted in SQLite, claimed by
//! polling workers, retried with backoff when a handler asks for it, and
//! optionally fired from persisted cron schedules. The [`JobService`]
//! singleton owns the engine and doubles as the publisher the database
//! layer hands transaction-deferred jobs to.

pub mod cron;
pub mod error;
pub mod job;
pub mod queue;
pub mod service;
pub mod setup;
pub mod sqlite;
pub mod types;

pub use cron::{CronJob, DEFAULT_TIMEZONE};
pub use error::{JobsError, Result};
pub use job::{Job, OneTimeJob};
pub use queue::QueueDriver;
pub use service::JobService;
pub use setup::JobSetup;
pub use sqlite::{QueueSettings, SqliteQueue};
pub use types::{JobFailure, JobHandler, JobState, QueueJob, ScheduleInfo, SubscribeOptions};
