// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-operation context: identity, logger and database access.
//!
//! Every inbound request and every job execution starts by creating a
//! `Context`. Business logic only ever touches the database through the
//! context's [`DatabaseService`], and a new derived context is minted each
//! time code enters a nested transaction.

use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::logger::ContextLogger;
use crate::publish::JobPublisher;
use crate::service::DatabaseService;

/// What kind of operation a context is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
	Route,
	Job,
}

impl ControlType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ControlType::Route => "route",
			ControlType::Job => "job",
		}
	}
}

/// Names the operation a context is currently executing, for logging and
/// query tagging.
#[derive(Debug, Clone)]
pub struct ControlData {
	pub controller_name: String,
	pub control_name: String,
	pub control_type: ControlType,
}

/// Process-wide handles resolved by [`Context::create`], installed once at
/// startup.
#[derive(Clone)]
pub struct CoreServices {
	pub pool: SqlitePool,
	pub publisher: Arc<dyn JobPublisher>,
}

static SERVICES: OnceLock<CoreServices> = OnceLock::new();

/// Install the process-wide pool and job publisher. Fails if called twice.
pub fn install_services(services: CoreServices) -> Result<()> {
	SERVICES
		.set(services)
		.map_err(|_| DbError::Internal("core services already installed".to_string()))
}

fn services() -> Result<&'static CoreServices> {
	SERVICES
		.get()
		.ok_or_else(|| DbError::Internal("core services not installed".to_string()))
}

pub(crate) struct ContextInner {
	pub(crate) id: Uuid,
	pub(crate) logger: ContextLogger,
	pub(crate) database_service: Arc<DatabaseService>,
	control_data: Mutex<Option<ControlData>>,
}

/// Per-request/per-job identity carrying a logger, a database service and
/// free-form log metadata. Cheap to clone; clones refer to the same context.
#[derive(Clone)]
pub struct Context {
	pub(crate) inner: Arc<ContextInner>,
}

impl Context {
	/// Build a fresh root context from the installed process-wide services.
	pub fn create() -> Result<Context> {
		let services = services()?;
		Ok(Self::create_from_parts(
			None,
			services.pool.clone(),
			services.publisher.clone(),
		))
	}

	/// Like [`Context::create`] but reusing an existing identity.
	pub fn create_with_id(id: Uuid) -> Result<Context> {
		let services = services()?;
		Ok(Self::create_from_parts(
			Some(id),
			services.pool.clone(),
			services.publisher.clone(),
		))
	}

	/// Build a root context from explicit parts. Composition roots and tests
	/// use this directly; request handlers go through [`Context::create`].
	pub fn create_from_parts(
		id: Option<Uuid>,
		pool: SqlitePool,
		publisher: Arc<dyn JobPublisher>,
	) -> Context {
		let id = id.unwrap_or_else(Uuid::new_v4);
		let logger = ContextLogger::root().child();
		let database_service = Arc::new(DatabaseService::create(logger.clone(), pool, publisher));
		let context = Context {
			inner: Arc::new(ContextInner {
				id,
				logger,
				database_service: database_service.clone(),
				control_data: Mutex::new(None),
			}),
		};
		context.add_metadata(metadata_fields(&[("context_id", json!(id.to_string()))]));
		database_service.set_context(&context);
		context
	}

	pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Context {
		Context { inner }
	}

	pub fn id(&self) -> Uuid {
		self.inner.id
	}

	pub fn logger(&self) -> &ContextLogger {
		&self.inner.logger
	}

	pub fn database_service(&self) -> &Arc<DatabaseService> {
		&self.inner.database_service
	}

	/// Merge fields into the log metadata. All subsequent log lines from
	/// this context include the merged fields.
	pub fn add_metadata(&self, fields: Map<String, Value>) {
		self.inner.logger.add_metadata(fields);
	}

	/// Record the operation this context is executing. Warns (rather than
	/// failing) when called twice, because a double call must not interrupt
	/// request processing. Also propagates the control name into the
	/// database service as a query comment.
	pub fn set_control_data(&self, data: ControlData) {
		{
			let mut control_data = self
				.inner
				.control_data
				.lock()
				.expect("control data poisoned");
			if control_data.is_some() {
				self.inner
					.logger
					.warn("set_control_data called after data already set");
			}
			*control_data = Some(data.clone());
		}
		self.add_metadata(metadata_fields(&[
			("controller_name", json!(data.controller_name)),
			("control_name", json!(data.control_name)),
			("control_type", json!(data.control_type.as_str())),
		]));
		self.inner
			.database_service
			.set_control_data(&data.control_name);
	}

	pub fn control_data(&self) -> Option<ControlData> {
		self.inner
			.control_data
			.lock()
			.expect("control data poisoned")
			.clone()
	}

	/// Derive a context for a nested transaction: same identity, a logger
	/// with a snapshot of the accumulated metadata, but bound to the given
	/// transaction-scoped database service.
	pub fn clone_for_transaction(&self, new_service: Arc<DatabaseService>) -> Context {
		let context = Context {
			inner: Arc::new(ContextInner {
				id: self.inner.id,
				logger: self.inner.logger.child(),
				database_service: new_service.clone(),
				control_data: Mutex::new(self.control_data()),
			}),
		};
		new_service.set_context(&context);
		context
	}

	/// Run `execute` in an entirely new root context (same identity) with
	/// its own independent transaction. Rarely needed: only when code must
	/// commit immediately without waiting on the surrounding request-level
	/// transaction.
	///
	/// Using this violates assumptions built into the test harness: tests
	/// exercising code paths that reach this must truncate the affected
	/// tables themselves, since the usual rollback will not cover rows
	/// committed here.
	pub async fn danger_run_in_new_context_transaction<T, E, F, Fut>(
		original: &Context,
		execute: F,
	) -> std::result::Result<T, E>
	where
		E: From<DbError>,
		F: FnOnce(Context) -> Fut,
		Fut: std::future::Future<Output = std::result::Result<T, E>>,
	{
		let service = original.database_service();
		let context = Context::create_from_parts(
			Some(original.id()),
			service.root_pool().clone(),
			service.job_publisher().clone(),
		);
		let database_service = context.database_service().clone();
		database_service.run_in_transaction(execute).await
	}
}

/// Build a metadata map from key/value pairs.
pub fn metadata_fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
	pairs
		.iter()
		.map(|(key, value)| (key.to_string(), value.clone()))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{create_test_pool, create_users_table, RecordingPublisher};

	#[tokio::test]
	async fn test_create_binds_service_to_context() {
		let pool = create_test_pool().await;
		let context = Context::create_from_parts(None, pool, RecordingPublisher::new_arc());
		assert!(!context.database_service().is_in_transaction());
		assert_eq!(
			context.logger().snapshot().get("context_id"),
			Some(&json!(context.id().to_string()))
		);
	}

	#[tokio::test]
	#[should_panic(expected = "already bound")]
	async fn test_rebinding_service_panics() {
		let pool = create_test_pool().await;
		let context = Context::create_from_parts(None, pool, RecordingPublisher::new_arc());
		// The service was bound during create; a second bind is a
		// programming error.
		context.database_service().set_context(&context);
	}

	#[tokio::test]
	async fn test_transaction_context_metadata_is_isolated() {
		let pool = create_test_pool().await;
		let context = Context::create_from_parts(None, pool, RecordingPublisher::new_arc());
		let parent_logger = context.logger().clone();
		let parent_id = context.id();
		context
			.database_service()
			.run_in_transaction::<_, DbError, _, _>(|tx| async move {
				assert_eq!(tx.id(), parent_id);
				tx.add_metadata(metadata_fields(&[("tx_only", json!(true))]));
				assert_eq!(tx.logger().snapshot().get("tx_only"), Some(&json!(true)));
				Ok::<_, DbError>(())
			})
			.await
			.unwrap();
		assert_eq!(parent_logger.snapshot().get("tx_only"), None);
	}

	#[tokio::test]
	async fn test_danger_transaction_commits_independently_of_enclosing() {
		let pool = create_test_pool().await;
		create_users_table(&pool).await;
		let context = Context::create_from_parts(None, pool, RecordingPublisher::new_arc());

		let result = context
			.database_service()
			.run_in_transaction::<(), DbError, _, _>(|tx| async move {
				let request_id = tx.id();
				Context::danger_run_in_new_context_transaction::<_, DbError, _, _>(
					&tx,
					|fresh| async move {
						// Same logical identity, independent transaction.
						assert_eq!(fresh.id(), request_id);
						fresh
							.database_service()
							.raw_query(
								"INSERT INTO users (id, display_name, created_at, updated_at) \
								 VALUES ('kept', 'Kept', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
							)
							.execute()
							.await?;
						Ok(())
					},
				)
				.await?;
				tx.database_service()
					.raw_query(
						"INSERT INTO users (id, display_name, created_at, updated_at) \
						 VALUES ('discarded', 'Discarded', '2025-01-01T00:00:00Z', '2025-01-01T00:00:00Z')",
					)
					.execute()
					.await?;
				Err(DbError::Internal("abort".to_string()))
			})
			.await;
		assert!(result.is_err());

		// The escape hatch's row survives the enclosing rollback.
		let rows = context
			.database_service()
			.raw_query("SELECT id FROM users")
			.fetch_rows()
			.await
			.unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(sqlx::Row::get::<String, _>(&rows[0], "id"), "kept");
	}

	#[tokio::test]
	async fn test_set_control_data_twice_warns_but_does_not_fail() {
		let pool = create_test_pool().await;
		let context = Context::create_from_parts(None, pool, RecordingPublisher::new_arc());
		context.set_control_data(ControlData {
			controller_name: "profiles".to_string(),
			control_name: "create_draft".to_string(),
			control_type: ControlType::Route,
		});
		context.set_control_data(ControlData {
			controller_name: "profiles".to_string(),
			control_name: "update_draft".to_string(),
			control_type: ControlType::Route,
		});
		let control_data = context.control_data().unwrap();
		assert_eq!(control_data.control_name, "update_draft");
		assert_eq!(
			context.logger().snapshot().get("control_name"),
			Some(&json!("update_draft"))
		);
	}
}
