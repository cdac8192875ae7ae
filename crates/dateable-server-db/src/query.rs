// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lazily-executed queries routed through a [`DatabaseService`].
//!
//! A `ServiceQuery` holds SQL plus bindings and only touches the database
//! when one of the fetch/execute methods is awaited. Execution acquires the
//! service's access lock, attaches the reserved transaction connection if
//! one is open, and releases the lock before rows are mapped to models so
//! that result mapping never blocks other queries.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::service::DatabaseService;

/// A database-backed model type, mapped from a row of its table.
///
/// The table name tags query errors so failures can be diagnosed without
/// reproducing them.
pub trait Model: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin {
	const TABLE: &'static str;
}

/// An owned SQL binding value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
	Null,
	Bool(bool),
	Integer(i64),
	Real(f64),
	Text(String),
	Blob(Vec<u8>),
}

impl From<bool> for SqlParam {
	fn from(value: bool) -> Self {
		SqlParam::Bool(value)
	}
}

impl From<i32> for SqlParam {
	fn from(value: i32) -> Self {
		SqlParam::Integer(value as i64)
	}
}

impl From<i64> for SqlParam {
	fn from(value: i64) -> Self {
		SqlParam::Integer(value)
	}
}

impl From<u32> for SqlParam {
	fn from(value: u32) -> Self {
		SqlParam::Integer(value as i64)
	}
}

impl From<f64> for SqlParam {
	fn from(value: f64) -> Self {
		SqlParam::Real(value)
	}
}

impl From<&str> for SqlParam {
	fn from(value: &str) -> Self {
		SqlParam::Text(value.to_string())
	}
}

impl From<String> for SqlParam {
	fn from(value: String) -> Self {
		SqlParam::Text(value)
	}
}

impl From<Uuid> for SqlParam {
	fn from(value: Uuid) -> Self {
		SqlParam::Text(value.to_string())
	}
}

impl From<DateTime<Utc>> for SqlParam {
	fn from(value: DateTime<Utc>) -> Self {
		SqlParam::Text(value.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
	}
}

impl From<Vec<u8>> for SqlParam {
	fn from(value: Vec<u8>) -> Self {
		SqlParam::Blob(value)
	}
}

impl<T> From<Option<T>> for SqlParam
where
	T: Into<SqlParam>,
{
	fn from(value: Option<T>) -> Self {
		match value {
			Some(value) => value.into(),
			None => SqlParam::Null,
		}
	}
}

pub(crate) fn bind_params<'q>(
	mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
	params: &'q [SqlParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
	for param in params {
		query = match param {
			SqlParam::Null => query.bind(None::<String>),
			SqlParam::Bool(value) => query.bind(*value),
			SqlParam::Integer(value) => query.bind(*value),
			SqlParam::Real(value) => query.bind(*value),
			SqlParam::Text(value) => query.bind(value.as_str()),
			SqlParam::Blob(value) => query.bind(value.as_slice()),
		};
	}
	query
}

/// A lazily-executed query bound to a database service.
#[must_use = "queries do nothing until fetched or executed"]
pub struct ServiceQuery<'a, M = ()> {
	service: &'a DatabaseService,
	sql: String,
	params: Vec<SqlParam>,
	table: Option<&'static str>,
	log_errors: bool,
	_model: PhantomData<M>,
}

impl<'a, M> ServiceQuery<'a, M> {
	pub(crate) fn new(
		service: &'a DatabaseService,
		sql: &str,
		table: Option<&'static str>,
	) -> Self {
		Self {
			service,
			sql: sql.to_string(),
			params: Vec::new(),
			table,
			log_errors: false,
			_model: PhantomData,
		}
	}

	/// Append a binding for the next `?` placeholder.
	pub fn bind(mut self, value: impl Into<SqlParam>) -> Self {
		self.params.push(value.into());
		self
	}

	/// Log database-level errors (tagged with table name and transaction id)
	/// before they are returned.
	pub fn log_errors(mut self) -> Self {
		self.log_errors = true;
		self
	}

	/// Run the statement, returning the number of affected rows.
	pub async fn execute(self) -> Result<u64> {
		self.service
			.run_execute(&self.sql, &self.params, self.table, self.log_errors)
			.await
	}

	/// Run the query and return untyped rows.
	pub async fn fetch_rows(self) -> Result<Vec<SqliteRow>> {
		self.service
			.run_fetch(&self.sql, &self.params, self.table, self.log_errors)
			.await
	}
}

impl<'a, M: Model> ServiceQuery<'a, M> {
	/// Run the query and map every row to the model type. Mapping happens
	/// after the access lock is released.
	pub async fn fetch_all(self) -> Result<Vec<M>> {
		let rows = self
			.service
			.run_fetch(&self.sql, &self.params, self.table, self.log_errors)
			.await?;
		rows.iter()
			.map(|row| M::from_row(row).map_err(DbError::from))
			.collect()
	}

	/// Run the query and map the single expected row.
	pub async fn fetch_one(self) -> Result<M> {
		let table = self.table;
		match self.fetch_optional().await? {
			Some(model) => Ok(model),
			None => Err(DbError::NotFound(table.unwrap_or("row").to_string())),
		}
	}

	/// Run the query and map the first row, if any.
	pub async fn fetch_optional(self) -> Result<Option<M>> {
		let rows = self
			.service
			.run_fetch(&self.sql, &self.params, self.table, self.log_errors)
			.await?;
		rows.first()
			.map(|row| M::from_row(row).map_err(DbError::from))
			.transpose()
	}
}
