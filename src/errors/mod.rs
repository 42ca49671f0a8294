use thiserror::Error;

/// Typed error hierarchy for tether.
///
/// Module boundaries (store calls, token validation, ranking updates,
/// the HTTP surface) speak in these kinds; leaf code may keep
/// `anyhow::Result` and flow into `Internal` through `?`.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("transient failure: {message}")]
    Transient { message: String, status: Option<u16> },

    #[error("invariant violated: {0}")]
    Fatal(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TetherError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Transient {
            message: message.into(),
            status,
        }
    }

    /// Whether the retry engine may re-attempt the failed operation.
    ///
    /// Narrow by default: only transient transport/upstream failures and
    /// rate limits qualify. Cancellation, validation, and identity errors
    /// never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// HTTP status the outermost boundary projects this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authentication(_) => 401,
            Self::Authorization(_) => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::RateLimited { .. } => 429,
            Self::Transient { .. } => 503,
            Self::Fatal(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine code for clients. Variant-driven except `Conflict`,
    /// which carries its own code (e.g. `EMAIL_ALREADY_EXISTS`), and
    /// `NotFound`, which names the entity (e.g. `USER_NOT_FOUND`).
    pub fn machine_code(&self) -> String {
        match self {
            Self::Validation { .. } => "VALIDATION_FAILED".to_string(),
            Self::Authentication(_) => "INVALID_CREDENTIALS".to_string(),
            Self::Authorization(_) => "FORBIDDEN".to_string(),
            Self::NotFound { entity } => {
                format!("{}_NOT_FOUND", entity.to_uppercase().replace(' ', "_"))
            }
            Self::Conflict { code, .. } => (*code).to_string(),
            Self::RateLimited { .. } => "RATE_LIMITED".to_string(),
            Self::Transient { .. } => "UPSTREAM_UNAVAILABLE".to_string(),
            Self::Fatal(_) | Self::Internal(_) => "INTERNAL_ERROR".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
