//! Result type aliases for Vigil.

use crate::VigilError;

/// A specialized `Result` type for Vigil operations.
pub type VigilResult<T> = Result<T, VigilError>;

/// A boxed future returning a `VigilResult`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = VigilResult<T>> + Send + 'a>>;
