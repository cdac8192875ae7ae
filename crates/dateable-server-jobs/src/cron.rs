// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::str::FromStr;

use crate::error::{JobsError, Result};
use crate::job::Job;
use crate::types::ScheduleInfo;

pub const DEFAULT_TIMEZONE: &str = "UTC";

/// A job fired by a persisted cron schedule instead of explicit enqueues.
///
/// Expressions use six or seven fields (seconds first, optional year), so
/// "every day at 09:00" is `0 0 9 * * *`. Schedules evaluate in UTC.
pub trait CronJob: Job
where
	Self::Data: Default,
{
	fn cron_expression(&self) -> &str;

	fn timezone(&self) -> &str {
		DEFAULT_TIMEZONE
	}

	/// The schedule row persisted by the queue engine. Validates the cron
	/// expression up front.
	fn schedule_info(&self) -> Result<ScheduleInfo> {
		let expression = self.cron_expression();
		cron::Schedule::from_str(expression).map_err(|source| JobsError::InvalidCron {
			expression: expression.to_string(),
			source,
		})?;
		let data = Self::Data::default();
		Ok(ScheduleInfo {
			name: self.queue_name(),
			cron: expression.to_string(),
			timezone: self.timezone().to_string(),
			data: serde_json::to_value(&data)?,
			options: self.publish_options(&data),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use dateable_server_db::Context;
	use serde::{Deserialize, Serialize};

	#[derive(Serialize, Deserialize, Default)]
	struct NoData {}

	struct NightlyCleanup;

	#[async_trait]
	impl Job for NightlyCleanup {
		type Data = NoData;

		fn job_name(&self) -> &'static str {
			"nightly-cleanup"
		}

		async fn execute(&self, _context: &Context, _data: NoData) -> Result<()> {
			Ok(())
		}
	}

	impl CronJob for NightlyCleanup {
		fn cron_expression(&self) -> &str {
			"0 0 3 * * *"
		}
	}

	#[test]
	fn test_schedule_info_uses_queue_name_and_defaults() {
		let info = NightlyCleanup.schedule_info().unwrap();
		assert_eq!(info.name, "nightly-cleanup");
		assert_eq!(info.cron, "0 0 3 * * *");
		assert_eq!(info.timezone, DEFAULT_TIMEZONE);
	}

	#[test]
	fn test_invalid_expression_is_rejected() {
		struct Broken;

		#[async_trait]
		impl Job for Broken {
			type Data = NoData;

			fn job_name(&self) -> &'static str {
				"broken"
			}

			async fn execute(&self, _context: &Context, _data: NoData) -> Result<()> {
				Ok(())
			}
		}

		impl CronJob for Broken {
			fn cron_expression(&self) -> &str {
				"every tuesday"
			}
		}

		assert!(matches!(
			Broken.schedule_info(),
			Err(JobsError::InvalidCron { .. })
		));
	}
}
