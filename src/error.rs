//! Engine error handling
//!
//! Only `ActionResult` and `CreationResult` ever reach callers of the mutation
//! pipeline. These errors are what the internals pass around, log and absorb.

use crate::structure::{PermissionLevel, StructureId};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside the structure engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store failure during {operation}: {reason}")]
    StoreFailure { operation: String, reason: String },

    #[error("Consistency violation on structure {structure}: attempted {attempted}, reverted to {reverted}")]
    ConsistencyViolation {
        structure: StructureId,
        attempted: String,
        reverted: String,
    },

    #[error("Notifier {subscriber} failed: {reason}")]
    NotifierFailure { subscriber: String, reason: String },

    #[error("Task {task} was aborted before producing a result")]
    TaskAborted { task: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("World {world} is not loaded")]
    WorldNotLoaded { world: String },

    #[error("Permission level {level:?} cannot be granted")]
    InvalidPermission { level: PermissionLevel },
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config {
            message: err.to_string(),
        }
    }
}

/// Create a store failure error
pub fn store_failure(operation: impl Into<String>, reason: impl std::fmt::Display) -> EngineError {
    EngineError::StoreFailure {
        operation: operation.into(),
        reason: reason.to_string(),
    }
}

/// Turn a caught panic payload into something loggable
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload = std::panic::catch_unwind(|| panic!("store exploded"))
            .expect_err("closure should panic");
        assert_eq!(panic_message(payload.as_ref()), "store exploded");

        let owned = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7))
            .expect_err("closure should panic");
        assert_eq!(panic_message(owned.as_ref()), "formatted 7");
    }

    #[test]
    fn test_store_failure_display() {
        let err = store_failure("remove_by_id", "row not found");
        assert_eq!(err.to_string(), "Store failure during remove_by_id: row not found");
    }
}
