//! Active-test registry
//!
//! Tracks which test ids are live and which worker serves each, and
//! enforces the concurrency cap. A test occupies a slot from allocation
//! until release, even while no worker is assigned yet.

use parking_lot::Mutex;
use stagehand_common::{Error, Result};
use std::collections::HashMap;

pub struct TestRegistry<W> {
    limit: usize,
    tests: Mutex<HashMap<String, Option<W>>>,
}

impl<W: Clone> TestRegistry<W> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            tests: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for a new test, without a worker yet.
    pub fn allocate(&self, test_id: &str) -> Result<()> {
        let mut tests = self.tests.lock();
        if tests.contains_key(test_id) {
            return Err(Error::DuplicateTest {
                id: test_id.to_string(),
            });
        }
        if tests.len() >= self.limit {
            return Err(Error::ConcurrencyLimit { limit: self.limit });
        }
        tests.insert(test_id.to_string(), None);
        Ok(())
    }

    /// Attach the worker to an allocated slot. Reassignment is a bug in
    /// the caller, not a recoverable state.
    pub fn assign_worker(&self, test_id: &str, worker: W) -> Result<()> {
        match self.tests.lock().get_mut(test_id) {
            Some(Some(_)) => Err(Error::Internal(format!(
                "test \"{test_id}\" already has a worker"
            ))),
            Some(slot) => {
                *slot = Some(worker);
                Ok(())
            }
            None => Err(Error::UnknownTest {
                id: test_id.to_string(),
            }),
        }
    }

    pub fn get_worker(&self, test_id: &str) -> Result<W> {
        match self.tests.lock().get(test_id) {
            Some(Some(worker)) => Ok(worker.clone()),
            Some(None) => Err(Error::WorkerNotAssigned {
                id: test_id.to_string(),
            }),
            None => Err(Error::UnknownTest {
                id: test_id.to_string(),
            }),
        }
    }

    /// Free the slot. Idempotent; returns the worker if one was assigned.
    pub fn release(&self, test_id: &str) -> Option<W> {
        self.tests.lock().remove(test_id).flatten()
    }

    pub fn active(&self) -> usize {
        self.tests.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_ids() {
        let registry: TestRegistry<u32> = TestRegistry::new(8);
        registry.allocate("test-1").unwrap();
        match registry.allocate("test-1") {
            Err(Error::DuplicateTest { id }) => assert_eq!(id, "test-1"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn enforces_the_concurrency_limit() {
        let registry: TestRegistry<u32> = TestRegistry::new(2);
        registry.allocate("a").unwrap();
        registry.allocate("b").unwrap();
        match registry.allocate("c") {
            Err(Error::ConcurrencyLimit { limit }) => assert_eq!(limit, 2),
            other => panic!("expected limit error, got {other:?}"),
        }

        // Releasing one slot admits exactly one more test.
        registry.release("a");
        registry.allocate("c").unwrap();
        assert!(matches!(
            registry.allocate("d"),
            Err(Error::ConcurrencyLimit { .. })
        ));
    }

    #[test]
    fn assigning_to_an_unknown_test_fails() {
        let registry: TestRegistry<u32> = TestRegistry::new(8);
        assert!(matches!(
            registry.assign_worker("missing", 7),
            Err(Error::UnknownTest { .. })
        ));
    }

    #[test]
    fn a_worker_cannot_be_reassigned() {
        let registry: TestRegistry<u32> = TestRegistry::new(8);
        registry.allocate("test-1").unwrap();
        registry.assign_worker("test-1", 1).unwrap();
        assert!(registry.assign_worker("test-1", 2).is_err());
        assert_eq!(registry.get_worker("test-1").unwrap(), 1);
    }

    #[test]
    fn get_worker_reflects_assignment_state() {
        let registry: TestRegistry<u32> = TestRegistry::new(8);
        registry.allocate("test-1").unwrap();

        assert!(matches!(
            registry.get_worker("test-1"),
            Err(Error::WorkerNotAssigned { .. })
        ));

        registry.assign_worker("test-1", 42).unwrap();
        assert_eq!(registry.get_worker("test-1").unwrap(), 42);

        assert_eq!(registry.release("test-1"), Some(42));
        assert!(matches!(
            registry.get_worker("test-1"),
            Err(Error::UnknownTest { .. })
        ));
    }

    #[test]
    fn releasing_an_unknown_test_is_a_no_op() {
        let registry: TestRegistry<u32> = TestRegistry::new(8);
        assert_eq!(registry.release("missing"), None);
        assert_eq!(registry.active(), 0);
    }
}
