// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lock-guarded wrapper around one database connection/transaction handle.
//!
//! Once `run_in_transaction` starts a transaction it reserves a single
//! connection that every statement inside the transaction must use. The
//! access lock serializes use of the handle so statements from concurrent
//! tasks can never interleave on it, and jobs enqueued mid-transaction are
//! buffered and published only after the commit succeeds.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde_json::json;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::SqlitePool;

use crate::context::{Context, ContextInner};
use crate::error::{DbError, Result};
use crate::lock::AccessLock;
use crate::logger::ContextLogger;
use crate::publish::{JobPublisher, OneTimeJobInstance};
use crate::query::{bind_params, Model, ServiceQuery, SqlParam};

/// State shared between a root service and all of its transactional clones.
struct SharedData {
	query_comment: Mutex<String>,
	queries_run: AtomicU64,
	next_transaction_id: AtomicI64,
	pool: SqlitePool,
	publisher: Arc<dyn JobPublisher>,
	logger: ContextLogger,
}

/// A reserved connection with an open transaction (or savepoint) on it.
#[derive(Clone)]
pub(crate) struct TransactionHandle {
	conn: Arc<tokio::sync::Mutex<TxConnection>>,
	depth: u32,
}

/// Owns the reserved connection and tracks how many transaction levels are
/// still open on it. If the handle is dropped while a level is open (the
/// body future was cancelled, or a commit failed and the rollback did too),
/// the connection is detached from the pool and closed; returning it would
/// poison every later checkout with the dangling transaction.
struct TxConnection {
	conn: Option<PoolConnection<Sqlite>>,
	open_depth: u32,
}

impl TxConnection {
	fn executor(&mut self) -> &mut SqliteConnection {
		self.conn
			.as_mut()
			.expect("transaction connection already closed")
			.as_mut()
	}
}

impl Drop for TxConnection {
	fn drop(&mut self) {
		if self.open_depth > 0 {
			if let Some(conn) = self.conn.take() {
				drop(conn.detach());
			}
		}
	}
}

/// Either the unscoped pool or an open transaction, depending on nesting.
enum Transactable {
	Pool(SqlitePool),
	Transaction(TransactionHandle),
}

pub struct DatabaseService {
	shared: Arc<SharedData>,
	handle: Transactable,
	transaction_id: Option<i64>,
	access_lock: AccessLock,
	context: OnceLock<Weak<ContextInner>>,
	pending_jobs: Mutex<Vec<OneTimeJobInstance>>,
}

impl DatabaseService {
	/// Build a root service bound to the unscoped pool. Created once per
	/// context.
	pub fn create(
		logger: ContextLogger,
		pool: SqlitePool,
		publisher: Arc<dyn JobPublisher>,
	) -> DatabaseService {
		DatabaseService {
			shared: Arc::new(SharedData {
				query_comment: Mutex::new(String::new()),
				queries_run: AtomicU64::new(0),
				next_transaction_id: AtomicI64::new(1),
				pool: pool.clone(),
				publisher,
				logger,
			}),
			handle: Transactable::Pool(pool),
			transaction_id: None,
			access_lock: AccessLock::new(),
			context: OnceLock::new(),
			pending_jobs: Mutex::new(Vec::new()),
		}
	}

	/// One-time binding to the owning context. A second call is a
	/// programming error.
	pub fn set_context(&self, context: &Context) {
		assert!(
			self.context.set(Arc::downgrade(&context.inner)).is_ok(),
			"DatabaseService is already bound to a context"
		);
	}

	fn bound_context(&self) -> Context {
		let weak = self
			.context
			.get()
			.expect("DatabaseService has no bound context");
		Context::from_inner(weak.upgrade().expect("bound context was dropped"))
	}

	/// Start a lazily-executed query against the model's table. The query
	/// counter is shared across all transactional clones of this service.
	pub fn query<M: Model>(&self, sql: &str) -> ServiceQuery<'_, M> {
		self.shared.queries_run.fetch_add(1, Ordering::Relaxed);
		ServiceQuery::new(self, sql, Some(M::TABLE))
	}

	/// Start a lazily-executed raw SQL query.
	pub fn raw_query(&self, sql: &str) -> ServiceQuery<'_, ()> {
		ServiceQuery::new(self, sql, None)
	}

	pub fn is_in_transaction(&self) -> bool {
		matches!(self.handle, Transactable::Transaction(_))
	}

	pub fn transaction_id(&self) -> Option<i64> {
		self.transaction_id
	}

	pub fn queries_run(&self) -> u64 {
		self.shared.queries_run.load(Ordering::Relaxed)
	}

	/// Set the free-text comment prepended to emitted SQL, shared across
	/// the whole service lineage. Used purely for observability.
	pub fn set_control_data(&self, control_name: &str) {
		let mut comment = self
			.shared
			.query_comment
			.lock()
			.expect("query comment poisoned");
		*comment = format!("control:{control_name}");
	}

	pub(crate) fn root_pool(&self) -> &SqlitePool {
		&self.shared.pool
	}

	pub(crate) fn job_publisher(&self) -> &Arc<dyn JobPublisher> {
		&self.shared.publisher
	}

	/// Run `execute` inside a transaction on this service's handle.
	///
	/// The access lock is held for the entire transaction body, so nested
	/// transactional regions sharing one connection holder run strictly
	/// one at a time. On success the transaction commits and any jobs the
	/// sub-context buffered are flushed; on error the transaction rolls
	/// back and the original error propagates unchanged.
	pub async fn run_in_transaction<T, E, F, Fut>(&self, execute: F) -> std::result::Result<T, E>
	where
		E: From<DbError>,
		F: FnOnce(Context) -> Fut,
		Fut: Future<Output = std::result::Result<T, E>>,
	{
		let _guard = self.access_lock.lock().await;
		let transaction = self.begin_transaction().await.map_err(E::from)?;
		let sub_service = Arc::new(self.clone_for_transaction(transaction.clone()));
		let sub_context = self.bound_context().clone_for_transaction(sub_service.clone());

		match execute(sub_context).await {
			Ok(value) => {
				if let Err(commit_error) = commit(&transaction).await {
					if let Err(rollback_error) = rollback(&transaction).await {
						self.shared.logger.error_with(
							"failed to roll back after commit error",
							json!({
								"transaction_id": sub_service.transaction_id(),
								"error": rollback_error.to_string(),
							}),
						);
					}
					return Err(E::from(commit_error));
				}
				let jobs = sub_service.take_pending_jobs();
				self.flush_jobs_after_commit(jobs).await;
				Ok(value)
			}
			Err(error) => {
				if let Err(rollback_error) = rollback(&transaction).await {
					self.shared.logger.error_with(
						"failed to roll back transaction",
						json!({
							"transaction_id": sub_service.transaction_id(),
							"error": rollback_error.to_string(),
						}),
					);
				}
				Err(error)
			}
		}
	}

	/// Publish a job now, or buffer it when a transaction is open so it is
	/// only published once the transaction commits. Publishing immediately
	/// inside an open transaction would let a worker observe data that may
	/// later be rolled back.
	pub async fn enqueue_job(&self, instance: OneTimeJobInstance) -> Result<()> {
		let _guard = self.access_lock.lock().await;
		if self.is_in_transaction() {
			self.pending_jobs
				.lock()
				.expect("pending jobs poisoned")
				.push(instance);
			Ok(())
		} else {
			self.shared
				.publisher
				.publish(&instance)
				.await
				.map_err(DbError::from)
		}
	}

	/// Sibling service bound to the given transaction handle, sharing this
	/// service's shared data block. Must only be called while holding the
	/// access lock (i.e. from within `run_in_transaction`).
	fn clone_for_transaction(&self, handle: TransactionHandle) -> DatabaseService {
		assert!(
			self.access_lock.is_locked(),
			"clone_for_transaction requires the access lock to be held"
		);
		// Top-level transactions get a fresh id; savepoints inherit.
		let transaction_id = self.transaction_id.unwrap_or_else(|| {
			self.shared
				.next_transaction_id
				.fetch_add(1, Ordering::Relaxed)
		});
		DatabaseService {
			shared: self.shared.clone(),
			handle: Transactable::Transaction(handle),
			transaction_id: Some(transaction_id),
			access_lock: AccessLock::new(),
			context: OnceLock::new(),
			pending_jobs: Mutex::new(Vec::new()),
		}
	}

	async fn begin_transaction(&self) -> Result<TransactionHandle> {
		match &self.handle {
			Transactable::Pool(pool) => {
				let mut conn = pool.acquire().await?;
				sqlx::query("BEGIN").execute(conn.as_mut()).await?;
				Ok(TransactionHandle {
					conn: Arc::new(tokio::sync::Mutex::new(TxConnection {
						conn: Some(conn),
						open_depth: 1,
					})),
					depth: 1,
				})
			}
			Transactable::Transaction(parent) => {
				let depth = parent.depth + 1;
				{
					let mut guard = parent.conn.lock().await;
					sqlx::query(&format!("SAVEPOINT sp_{depth}"))
						.execute(guard.executor())
						.await?;
					guard.open_depth = depth;
				}
				Ok(TransactionHandle {
					conn: parent.conn.clone(),
					depth,
				})
			}
		}
	}

	fn take_pending_jobs(&self) -> Vec<OneTimeJobInstance> {
		std::mem::take(&mut *self.pending_jobs.lock().expect("pending jobs poisoned"))
	}

	/// Hand jobs buffered by a committed sub-transaction onward. Must never
	/// fail: the transaction has already committed, so errors here are
	/// logged and swallowed.
	async fn flush_jobs_after_commit(&self, jobs: Vec<OneTimeJobInstance>) {
		if self.is_in_transaction() {
			// Still inside an enclosing transaction: the jobs ride along
			// with it, published on its commit or dropped on its rollback.
			self.pending_jobs
				.lock()
				.expect("pending jobs poisoned")
				.extend(jobs);
			return;
		}
		for job in jobs {
			if let Err(error) = self.shared.publisher.publish(&job).await {
				self.shared.logger.error_with(
					"error publishing job after commit, ignoring",
					json!({
						"queue_name": job.queue_name,
						"error": error.to_string(),
					}),
				);
			}
		}
	}

	fn commented_sql(&self, sql: &str) -> String {
		let comment = self
			.shared
			.query_comment
			.lock()
			.expect("query comment poisoned");
		if comment.is_empty() {
			sql.to_string()
		} else {
			format!("/* {comment} */ {sql}")
		}
	}

	fn on_query_error(
		&self,
		error: sqlx::Error,
		table: Option<&'static str>,
		log_errors: bool,
	) -> DbError {
		if log_errors {
			self.shared.logger.error_with(
				"database error",
				json!({
					"table": table,
					"transaction_id": self.transaction_id,
					"error": error.to_string(),
				}),
			);
		}
		DbError::Sqlx(error)
	}

	pub(crate) async fn run_fetch(
		&self,
		sql: &str,
		params: &[SqlParam],
		table: Option<&'static str>,
		log_errors: bool,
	) -> Result<Vec<sqlx::sqlite::SqliteRow>> {
		let sql = self.commented_sql(sql);
		let result = {
			let _guard = self.access_lock.lock().await;
			match &self.handle {
				Transactable::Pool(pool) => {
					bind_params(sqlx::query(&sql), params).fetch_all(pool).await
				}
				Transactable::Transaction(transaction) => {
					let mut guard = transaction.conn.lock().await;
					bind_params(sqlx::query(&sql), params)
						.fetch_all(guard.executor())
						.await
				}
			}
			// Lock released here; callers map rows outside of it.
		};
		result.map_err(|error| self.on_query_error(error, table, log_errors))
	}

	pub(crate) async fn run_execute(
		&self,
		sql: &str,
		params: &[SqlParam],
		table: Option<&'static str>,
		log_errors: bool,
	) -> Result<u64> {
		let sql = self.commented_sql(sql);
		let result = {
			let _guard = self.access_lock.lock().await;
			match &self.handle {
				Transactable::Pool(pool) => {
					bind_params(sqlx::query(&sql), params).execute(pool).await
				}
				Transactable::Transaction(transaction) => {
					let mut guard = transaction.conn.lock().await;
					bind_params(sqlx::query(&sql), params)
						.execute(guard.executor())
						.await
				}
			}
		};
		result
			.map(|done| done.rows_affected())
			.map_err(|error| self.on_query_error(error, table, log_errors))
	}
}

async fn commit(transaction: &TransactionHandle) -> Result<()> {
	let mut guard = transaction.conn.lock().await;
	if transaction.depth == 1 {
		sqlx::query("COMMIT").execute(guard.executor()).await?;
	} else {
		sqlx::query(&format!("RELEASE SAVEPOINT sp_{}", transaction.depth))
			.execute(guard.executor())
			.await?;
	}
	guard.open_depth = transaction.depth - 1;
	Ok(())
}

async fn rollback(transaction: &TransactionHandle) -> Result<()> {
	let mut guard = transaction.conn.lock().await;
	if transaction.depth == 1 {
		sqlx::query("ROLLBACK").execute(guard.executor()).await?;
	} else {
		sqlx::query(&format!("ROLLBACK TO SAVEPOINT sp_{}", transaction.depth))
			.execute(guard.executor())
			.await?;
		sqlx::query(&format!("RELEASE SAVEPOINT sp_{}", transaction.depth))
			.execute(guard.executor())
			.await?;
	}
	guard.open_depth = transaction.depth - 1;
	Ok(())
}
