// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Jobs configuration section.

use serde::Deserialize;

/// Jobs configuration (runtime, fully resolved).
#[derive(Debug, Clone)]
pub struct JobsConfig {
	/// Whether this process subscribes queue workers at all. Disable on
	/// instances that should only publish.
	pub run_jobs: bool,
	/// Test mode: the queue engine is constructed but never started and
	/// publishes become no-ops.
	pub test_mode: bool,
	/// Interval between cron-schedule evaluations.
	pub schedule_tick_secs: u64,
	/// Completed queue rows older than this are deleted by the maintenance
	/// sweep.
	pub completed_retention_hours: u64,
}

impl Default for JobsConfig {
	fn default() -> Self {
		Self {
			run_jobs: true,
			test_mode: false,
			schedule_tick_secs: 60,
			completed_retention_hours: 2,
		}
	}
}

/// Jobs configuration layer (partial, for merging).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobsConfigLayer {
	#[serde(default)]
	pub run_jobs: Option<bool>,
	#[serde(default)]
	pub test_mode: Option<bool>,
	#[serde(default)]
	pub schedule_tick_secs: Option<u64>,
	#[serde(default)]
	pub completed_retention_hours: Option<u64>,
}

impl JobsConfigLayer {
	pub fn merge(&mut self, other: JobsConfigLayer) {
		if other.run_jobs.is_some() {
			self.run_jobs = other.run_jobs;
		}
		if other.test_mode.is_some() {
			self.test_mode = other.test_mode;
		}
		if other.schedule_tick_secs.is_some() {
			self.schedule_tick_secs = other.schedule_tick_secs;
		}
		if other.completed_retention_hours.is_some() {
			self.completed_retention_hours = other.completed_retention_hours;
		}
	}

	pub fn finalize(self) -> JobsConfig {
		JobsConfig {
			run_jobs: self.run_jobs.unwrap_or(true),
			test_mode: self.test_mode.unwrap_or(false),
			schedule_tick_secs: self.schedule_tick_secs.unwrap_or(60),
			completed_retention_hours: self.completed_retention_hours.unwrap_or(2),
		}
	}
}
