/// Errors originating from the cache itself.
///
/// Errors returned by a constructor are never wrapped: cache operations are generic over the
/// caller's error type, which only needs to be constructible from this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No constructor was provided for a missing key.
    #[error("constructor not provided")]
    ConstructorMissing,
    /// The construction task ended without producing a result.
    ///
    /// This happens when the constructor panics, or the runtime shuts down while it is running.
    #[error("construction aborted before producing a value")]
    ConstructionAborted,
}
