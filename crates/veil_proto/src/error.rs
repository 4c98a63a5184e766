use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtoError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
