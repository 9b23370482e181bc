//! Read-path failover.
//!
//! Reads try the primary store first and transparently fall back to the
//! secondary when the primary is unreachable. One store's answer wins
//! entirely per call; there is no partial result and no merging.

use sqlx::AnyConnection;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::store::sql::SqlStore;
use crate::store::traits::{StoreError, TxFuture};

#[derive(Error, Debug)]
pub enum ReadError {
    /// Both the primary and the secondary read failed. The source error is
    /// the secondary's (the last store asked).
    #[error("all stores unavailable: {0}")]
    AllStoresUnavailable(#[source] StoreError),
}

/// Executes reads against the primary store with secondary failover.
pub struct ReadCoordinator {
    primary: Arc<SqlStore>,
    secondary: Arc<SqlStore>,
}

impl ReadCoordinator {
    pub fn new(primary: Arc<SqlStore>, secondary: Arc<SqlStore>) -> Self {
        Self { primary, secondary }
    }

    /// Run `primary_read` in a primary-scoped transaction; on any failure,
    /// run `secondary_read` in a secondary-scoped transaction.
    ///
    /// The two closures must return the same type but are otherwise
    /// independent, so the secondary path can use its own query shape.
    #[tracing::instrument(skip_all)]
    pub async fn read_with_failover<T, P, S>(
        &self,
        primary_read: P,
        secondary_read: S,
    ) -> Result<T, ReadError>
    where
        T: Send,
        P: for<'c> FnOnce(&'c mut AnyConnection) -> TxFuture<'c, T> + Send,
        S: for<'c> FnOnce(&'c mut AnyConnection) -> TxFuture<'c, T> + Send,
    {
        match self.primary.in_transaction(primary_read).await {
            Ok(result) => {
                debug!("primary store read succeeded");
                metrics::record_read("primary", "success");
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "primary store read failed, failing over to secondary");
                metrics::record_read("primary", "error");

                match self.secondary.in_transaction(secondary_read).await {
                    Ok(result) => {
                        info!("secondary store read succeeded (failover)");
                        metrics::record_read("secondary", "success");
                        Ok(result)
                    }
                    Err(e2) => {
                        error!(error = %e2, "secondary store read failed as well");
                        metrics::record_read("secondary", "error");
                        Err(ReadError::AllStoresUnavailable(e2))
                    }
                }
            }
        }
    }

    /// Failover variant that reuses one read operation against both
    /// transaction managers.
    ///
    /// Retained for earlier callers only. Because the same operation runs on
    /// the failover path, a read hard-wired to primary-side access cannot
    /// actually reach secondary-only data, so the fallback may fail for the
    /// same reason the primary attempt did.
    #[deprecated(
        note = "use read_with_failover with a dedicated secondary read; \
                reusing one operation cannot reach secondary-only data paths"
    )]
    pub async fn read_with_failover_shared<T, F>(&self, read: F) -> Result<T, ReadError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut AnyConnection) -> TxFuture<'c, T> + Send + Sync,
    {
        match self.primary.in_transaction(&read).await {
            Ok(result) => {
                debug!("primary store read succeeded");
                metrics::record_read("primary", "success");
                Ok(result)
            }
            Err(e) => {
                warn!(error = %e, "primary store read failed, retrying on secondary");
                metrics::record_read("primary", "error");

                match self.secondary.in_transaction(&read).await {
                    Ok(result) => {
                        info!("secondary store read succeeded (failover)");
                        metrics::record_read("secondary", "success");
                        Ok(result)
                    }
                    Err(e2) => {
                        error!(error = %e2, "secondary store read failed as well");
                        metrics::record_read("secondary", "error");
                        Err(ReadError::AllStoresUnavailable(e2))
                    }
                }
            }
        }
    }
}
