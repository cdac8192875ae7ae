// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use tokio::sync::{Mutex, MutexGuard};

/// Exclusive-access lock around a database handle.
///
/// Once a transaction is started it reserves a single connection that is used
/// by all statements issued within it. This lock enforces "at most one
/// in-flight database operation per handle": every query execution and every
/// transaction body acquires it first. Waiters are served in acquisition
/// order (tokio mutexes are FIFO).
pub(crate) struct AccessLock {
	inner: Mutex<()>,
}

impl AccessLock {
	pub(crate) fn new() -> Self {
		Self {
			inner: Mutex::new(()),
		}
	}

	pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
		self.inner.lock().await
	}

	/// Whether the lock is currently held. Probing only; used to assert the
	/// caller-must-hold-the-lock contract of `clone_for_transaction`.
	pub(crate) fn is_locked(&self) -> bool {
		self.inner.try_lock().is_err()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_is_locked_reflects_guard_lifetime() {
		let lock = AccessLock::new();
		assert!(!lock.is_locked());
		let guard = lock.lock().await;
		assert!(lock.is_locked());
		drop(guard);
		assert!(!lock.is_locked());
	}
}
