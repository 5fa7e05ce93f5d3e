use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("decode error: {message}")]
    Decode { message: String },
    #[error("conversion error: {message}")]
    Conversion { message: String },
    #[error("invalid {kind} value '{value}'")]
    InvalidEnumValue { kind: &'static str, value: String },
    #[error("missing identifier field '{field}' for {type_name}")]
    MissingIdentifier { type_name: String, field: String },
}

impl StrataError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub fn invalid_enum(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidEnumValue {
            kind,
            value: value.into(),
        }
    }

    pub fn missing_identifier(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingIdentifier {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Capture treats these as per-field failures and keeps going.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Conversion { .. })
    }
}

pub type StrataResult<T> = Result<T, StrataError>;

impl From<sea_orm::DbErr> for StrataError {
    fn from(value: sea_orm::DbErr) -> Self {
        StrataError::storage(value.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(value: serde_json::Error) -> Self {
        StrataError::storage(format!("json: {value}"))
    }
}
