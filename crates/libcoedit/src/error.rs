use thiserror::Error;

use coedit_protocol::{ErrorCode, LockKey, RowId};

#[derive(Error, Debug)]
pub enum CoeditError {
    #[error("unknown entity kind: {0}")]
    EntityNotFound(String),

    #[error("row not found: {0}")]
    RowNotFound(RowId),

    #[error("field {field} is not editable on {entity}")]
    FieldNotEditable { entity: String, field: String },

    #[error("write rejected for {key}: {reason}")]
    WriteRejected { key: LockKey, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoeditError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            CoeditError::EntityNotFound(_) => (ErrorCode::EntityNotFound, self.to_string()),
            CoeditError::RowNotFound(_) => (ErrorCode::RowNotFound, self.to_string()),
            CoeditError::FieldNotEditable { .. } => {
                (ErrorCode::FieldNotEditable, self.to_string())
            }
            CoeditError::WriteRejected { .. } => (ErrorCode::WriteRejected, self.to_string()),
            CoeditError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
