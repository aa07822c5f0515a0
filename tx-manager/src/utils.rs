// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Critical sections guarded this way only copy plain fields, so the data
/// is still consistent after a poisoning panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shorten a hash for log lines
pub(crate) fn short_hash(hash: &str) -> &str {
    hash.get(..10).unwrap_or(hash)
}
