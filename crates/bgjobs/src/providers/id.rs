//! Id generation for scheduled jobs

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces a unique id for every scheduled execution
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUID v4 ids
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Sequential ids of the form `{prefix}-{n}`, starting at 1
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_ids_are_unique() {
        let ids: HashSet<String> = (0..100).map(|_| UuidGenerator.next_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("job");
        assert_eq!(ids.next_id(), "job-1");
        assert_eq!(ids.next_id(), "job-2");
    }
}
