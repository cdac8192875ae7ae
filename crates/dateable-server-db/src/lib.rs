// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transactional database access layer for the Dateable server.
//!
//! Every request and job run gets a [`Context`] carrying an identity, a
//! structured logger, and a [`DatabaseService`]. The service guards one
//! transactable handle behind an async access lock, runs nested transactions
//! as savepoints, and defers job publishes made inside a transaction until
//! the transaction commits.

pub mod context;
pub mod error;
mod lock;
pub mod logger;
pub mod pool;
pub mod publish;
pub mod query;
pub mod service;
pub mod testing;

pub use context::{
	install_services, metadata_fields, Context, ControlData, ControlType, CoreServices,
};
pub use error::{DbError, Result};
pub use logger::ContextLogger;
pub use pool::create_pool;
pub use publish::{JobPublisher, OneTimeJobInstance, PublishError, PublishOptions};
pub use query::{Model, ServiceQuery, SqlParam};
pub use service::DatabaseService;
