// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use dateable_server_db::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobsError {
	/// A job execution failure with an explicit retry decision. Every other
	/// variant is terminal for the attempt.
	#[error("Job failed: {message}")]
	Failed { message: String, retryable: bool },

	#[error("Database error: {0}")]
	Db(#[from] DbError),

	#[error("Database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Queue error: {0}")]
	Queue(String),

	#[error("Invalid cron expression '{expression}': {source}")]
	InvalidCron {
		expression: String,
		source: cron::error::Error,
	},

	#[error("JobService::setup has not been called")]
	NotInitialized,

	#[error("JobService::setup was already called")]
	AlreadyInitialized,
}

impl JobsError {
	/// Failure the queue driver should retry (subject to the retry limit).
	pub fn retryable(message: impl Into<String>) -> JobsError {
		JobsError::Failed {
			message: message.into(),
			retryable: true,
		}
	}

	/// Failure the queue driver must not retry.
	pub fn terminal(message: impl Into<String>) -> JobsError {
		JobsError::Failed {
			message: message.into(),
			retryable: false,
		}
	}

	pub fn is_retryable(&self) -> bool {
		matches!(self, JobsError::Failed { retryable: true, .. })
	}
}

pub type Result<T> = std::result::Result<T, JobsError>;
