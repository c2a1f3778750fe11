use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use super::DurableStore;
use crate::error::{PlanError, PlanResult};
use crate::plan::{Plan, PlanFilter, PlanId};

/// In-process arena. Ids are handed out from a monotonic counter.
///
/// `fail_reads` / `fail_writes` simulate an outage of the durable store.
#[derive(Debug)]
pub struct MemoryStore {
    next_id: AtomicU64,
    plans: RwLock<HashMap<PlanId, Plan>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            plans: RwLock::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> PlanResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PlanError::StoreUnavailable("memory store: reads disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> PlanResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PlanError::StoreUnavailable("memory store: writes disabled".to_string()));
        }
        Ok(())
    }
}

fn poisoned() -> PlanError {
    PlanError::StoreUnavailable("memory store lock poisoned".to_string())
}

impl DurableStore for MemoryStore {
    fn insert(&self, mut plan: Plan) -> PlanResult<Plan> {
        self.check_write()?;
        plan.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        plan.revision = 1;
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    fn load(&self, id: PlanId) -> PlanResult<Option<Plan>> {
        self.check_read()?;
        let plans = self.plans.read().map_err(|_| poisoned())?;
        Ok(plans.get(&id).cloned())
    }

    fn compare_and_swap(&self, plan: &Plan, expected: u64) -> PlanResult<()> {
        self.check_write()?;
        let mut plans = self.plans.write().map_err(|_| poisoned())?;
        let current = plans.get_mut(&plan.id).ok_or(PlanError::NotFound(plan.id))?;
        if current.revision != expected {
            return Err(PlanError::StaleRevision {
                id: plan.id,
                expected,
                found: current.revision,
            });
        }
        *current = plan.clone();
        Ok(())
    }

    fn query(&self, filter: &PlanFilter) -> PlanResult<Vec<Plan>> {
        self.check_read()?;
        let plans = self.plans.read().map_err(|_| poisoned())?;
        Ok(plans.values().filter(|p| filter.matches(p)).cloned().collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
