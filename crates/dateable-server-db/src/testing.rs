// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::publish::{JobPublisher, OneTimeJobInstance, PublishError};

/// In-memory pool for tests. Uses a uniquely named shared-cache database so
/// every pooled connection sees the same data.
pub async fn create_test_pool() -> SqlitePool {
	let url = format!(
		"sqlite:file:testdb-{}?mode=memory&cache=shared",
		Uuid::new_v4()
	);
	let options = SqliteConnectOptions::from_str(&url)
		.unwrap()
		.busy_timeout(Duration::from_secs(5));
	// Keep at least one connection open so the in-memory database survives.
	SqlitePoolOptions::new()
		.min_connections(1)
		.connect_with(options)
		.await
		.unwrap()
}

/// Publisher that records every job instance it receives.
#[derive(Default)]
pub struct RecordingPublisher {
	published: Mutex<Vec<OneTimeJobInstance>>,
}

impl RecordingPublisher {
	pub fn new_arc() -> Arc<RecordingPublisher> {
		Arc::new(RecordingPublisher::default())
	}

	pub fn published(&self) -> Vec<OneTimeJobInstance> {
		self.published.lock().unwrap().clone()
	}

	pub fn published_count(&self) -> usize {
		self.published.lock().unwrap().len()
	}
}

#[async_trait]
impl JobPublisher for RecordingPublisher {
	async fn publish(&self, instance: &OneTimeJobInstance) -> Result<(), PublishError> {
		self.published.lock().unwrap().push(instance.clone());
		Ok(())
	}
}

/// Publisher that rejects everything, for failure-path tests.
pub struct FailingPublisher;

#[async_trait]
impl JobPublisher for FailingPublisher {
	async fn publish(&self, _instance: &OneTimeJobInstance) -> Result<(), PublishError> {
		Err(PublishError("publisher unavailable".to_string()))
	}
}

pub async fn create_users_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS users (
			id TEXT PRIMARY KEY,
			display_name TEXT NOT NULL,
			primary_email TEXT UNIQUE,
			email_confirmed INTEGER DEFAULT 0,
			created_at TEXT NOT NULL,
			updated_at TEXT NOT NULL,
			deleted_at TEXT
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_profile_drafts_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS profile_drafts (
			id TEXT PRIMARY KEY,
			user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
			status TEXT NOT NULL,
			published_at TEXT,
			created_at TEXT NOT NULL,
			updated_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_profile_elements_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS profile_elements (
			id TEXT PRIMARY KEY,
			draft_id TEXT NOT NULL REFERENCES profile_drafts(id) ON DELETE CASCADE,
			element_type TEXT NOT NULL,
			position INTEGER NOT NULL,
			content TEXT,
			created_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}

pub async fn create_comments_table(pool: &SqlitePool) {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS comments (
			id TEXT PRIMARY KEY,
			author_id TEXT NOT NULL REFERENCES users(id),
			element_id TEXT NOT NULL REFERENCES profile_elements(id) ON DELETE CASCADE,
			body TEXT NOT NULL,
			created_at TEXT NOT NULL,
			deleted_at TEXT
		)
		"#,
	)
	.execute(pool)
	.await
	.unwrap();
}
