// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Id generation for executions, instances, jobs and log entries.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of unique ids.
pub trait IdGenerator: Send + Sync {
    /// Produce the next id.
    fn next_id(&self) -> String;

    /// Produce an activity instance id for `activity_id`.
    fn activity_instance_id(&self, activity_id: &str) -> String {
        format!("{}:{}", activity_id, self.next_id())
    }
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Monotonic ids (`1`, `2`, ...) for reproducible tests and log output.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids_are_monotonic() {
        let ids = SequentialIdGenerator::new();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
        assert_eq!(ids.activity_instance_id("task1"), "task1:3");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids = UuidIdGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
        assert!(ids.activity_instance_id("userTask").starts_with("userTask:"));
    }
}
