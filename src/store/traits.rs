use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Boxed future returned by a caller-supplied unit of work bound to one store.
///
/// The coordination core never inspects the unit's internals, only its
/// success/failure outcome and (for the primary write) its return value.
pub type TxFuture<'c, T> = BoxFuture<'c, Result<T, StoreError>>;
