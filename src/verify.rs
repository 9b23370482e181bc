//! Cross-store consistency checks.
//!
//! Diagnostics only: the verifier reports divergence, it never triggers
//! reconciliation. Production control flow goes through the write
//! orchestrator and the recovery worker.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::store::sql::SqlStore;
use crate::store::traits::StoreError;

/// Read-only comparator of a record's field projection across both stores.
pub struct ConsistencyVerifier {
    primary: Arc<SqlStore>,
    secondary: Arc<SqlStore>,
}

impl ConsistencyVerifier {
    pub fn new(primary: Arc<SqlStore>, secondary: Arc<SqlStore>) -> Self {
        Self { primary, secondary }
    }

    /// Compare one record field-for-field across both stores.
    ///
    /// Equality is null-aware: a JSON `null` and an absent field are
    /// equivalent, `null` against a concrete value is not. A record missing
    /// from either store reports inconsistent; store access errors propagate.
    pub async fn verify(&self, entity_type: &str, entity_id: i64) -> Result<bool, StoreError> {
        let (primary, secondary) = tokio::join!(
            self.primary.fetch_record(entity_type, entity_id),
            self.secondary.fetch_record(entity_type, entity_id),
        );

        let consistent = match (primary?, secondary?) {
            (Some(p), Some(s)) => fields_match(&p.fields, &s.fields),
            _ => false,
        };

        debug!(entity_type, entity_id, consistent, "consistency check");
        Ok(consistent)
    }

    /// Ids of `entity_type` present in the primary but not the secondary
    /// (records the secondary never saw).
    pub async fn find_primary_only(&self, entity_type: &str) -> Result<Vec<i64>, StoreError> {
        let (primary, secondary) = tokio::join!(
            self.primary.list_ids(entity_type),
            self.secondary.list_ids(entity_type),
        );
        Ok(difference(primary?, &secondary?))
    }

    /// Ids of `entity_type` present in the secondary but not the primary
    /// (ghost records left behind by failed compensations).
    pub async fn find_secondary_only(&self, entity_type: &str) -> Result<Vec<i64>, StoreError> {
        let (primary, secondary) = tokio::join!(
            self.primary.list_ids(entity_type),
            self.secondary.list_ids(entity_type),
        );
        Ok(difference(secondary?, &primary?))
    }
}

fn difference(keep: Vec<i64>, remove: &[i64]) -> Vec<i64> {
    let remove: BTreeSet<_> = remove.iter().collect();
    keep.into_iter().filter(|id| !remove.contains(id)).collect()
}

fn fields_match(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter().all(|key| {
        let va = a.get(key).unwrap_or(&Value::Null);
        let vb = b.get(key).unwrap_or(&Value::Null);
        va == vb
    })
}
