use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// A thread panicked while holding the underlying primitive.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}
