use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::DurableStore;
use crate::error::{PlanError, PlanResult};
use crate::plan::{Plan, PlanFilter, PlanId};

/// One row per plan; the full record is a JSON body, with symbol, state and
/// revision copied out for indexing and the CAS predicate.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> PlanResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> PlanResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> PlanResult<Self> {
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                state TEXT NOT NULL,
                revision INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plans_symbol_state ON plans (symbol, state);
            COMMIT;",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> PlanResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PlanError::StoreUnavailable("sqlite connection lock poisoned".to_string()))
    }
}

fn decode(body: &str) -> PlanResult<Plan> {
    Ok(serde_json::from_str(body)?)
}

impl DurableStore for SqliteStore {
    fn insert(&self, mut plan: Plan) -> PlanResult<Plan> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO plans (symbol, state, revision, updated_at, body) VALUES (?1, ?2, 1, ?3, '{}')",
            params![plan.symbol, plan.state.as_str(), plan.updated_at as i64],
        )?;
        plan.id = tx.last_insert_rowid() as PlanId;
        plan.revision = 1;
        let body = serde_json::to_string(&plan)?;
        tx.execute("UPDATE plans SET body = ?1 WHERE id = ?2", params![body, plan.id as i64])?;
        tx.commit()?;
        Ok(plan)
    }

    fn load(&self, id: PlanId) -> PlanResult<Option<Plan>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM plans WHERE id = ?1", params![id as i64], |row| row.get(0))
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn compare_and_swap(&self, plan: &Plan, expected: u64) -> PlanResult<()> {
        let body = serde_json::to_string(plan)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE plans SET state = ?1, revision = ?2, updated_at = ?3, body = ?4
             WHERE id = ?5 AND revision = ?6",
            params![
                plan.state.as_str(),
                plan.revision as i64,
                plan.updated_at as i64,
                body,
                plan.id as i64,
                expected as i64
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let found: Option<i64> = conn
            .query_row("SELECT revision FROM plans WHERE id = ?1", params![plan.id as i64], |row| {
                row.get(0)
            })
            .optional()?;
        match found {
            None => Err(PlanError::NotFound(plan.id)),
            Some(found) => Err(PlanError::StaleRevision {
                id: plan.id,
                expected,
                found: found as u64,
            }),
        }
    }

    fn query(&self, filter: &PlanFilter) -> PlanResult<Vec<Plan>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM plans WHERE (?1 IS NULL OR symbol = ?1) ORDER BY id")?;
        let rows = stmt.query_map(params![filter.symbol], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            let plan = decode(&body?)?;
            if filter.matches(&plan) {
                out.push(plan);
            }
        }
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanState;
    use crate::store::tests::{ctx, spec};

    #[test]
    fn test_insert_load_query() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.insert(Plan::from_spec(spec(), ctx(0))).unwrap();
        let b = store.insert(Plan::from_spec(spec(), ctx(0))).unwrap();
        assert_eq!(a.id + 1, b.id);

        let loaded = store.load(a.id).unwrap().unwrap();
        assert_eq!(loaded.id, a.id);
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.prices, a.prices);
        assert_eq!(loaded.state, PlanState::Pending);
        assert!(store.load(999).unwrap().is_none());

        let mut cancelled = b.clone();
        cancelled.state = PlanState::Cancelled;
        cancelled.revision = 2;
        store.compare_and_swap(&cancelled, 1).unwrap();

        let live = store.query(&PlanFilter::non_terminal()).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, a.id);
        assert_eq!(store.query(&PlanFilter::all().with_symbol("BTCUSDT")).unwrap().len(), 2);
        assert!(store.query(&PlanFilter::all().with_symbol("ETHUSDT")).unwrap().is_empty());
    }

    #[test]
    fn test_cas_mismatch() {
        let store = SqliteStore::in_memory().unwrap();
        let plan = store.insert(Plan::from_spec(spec(), ctx(0))).unwrap();
        let mut next = plan.clone();
        next.revision = 2;
        store.compare_and_swap(&next, 1).unwrap();
        let err = store.compare_and_swap(&next, 1).unwrap_err();
        assert!(matches!(err, PlanError::StaleRevision { found: 2, .. }));

        let mut ghost = plan;
        ghost.id = 42;
        assert!(matches!(store.compare_and_swap(&ghost, 1), Err(PlanError::NotFound(42))));
    }
}
