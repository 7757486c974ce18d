use thiserror::Error;

#[derive(Debug, Error)]
pub enum HayaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid parameters: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Provider error ({status}) after retries: {body}")]
    RetryableProvider { status: u16, body: String },

    #[error("Provider HTTP error ({status}): {body}")]
    ProviderHttp { status: u16, body: String },

    #[error("Path escapes allowed workspace roots: {path}")]
    WorkspaceViolation { path: String },

    #[error("Tool call denied by policy: {tool}")]
    ToolPolicyDenied { tool: String },

    #[error("Corrupt session file {session} at line {line}")]
    CorruptSession { session: String, line: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HayaError {
    /// Wire error code sent to clients in response frames. Closed set.
    pub fn code(&self) -> &'static str {
        match self {
            HayaError::Validation(_) | HayaError::Serialization(_) => "VALIDATION",
            HayaError::Auth(_) => "UNAUTHORIZED",
            HayaError::RateLimited { .. } => "RATE_LIMITED",
            HayaError::NotFound(_) => "NOT_FOUND",
            HayaError::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            HayaError::Config(_)
            | HayaError::RetryableProvider { .. }
            | HayaError::ProviderHttp { .. }
            | HayaError::WorkspaceViolation { .. }
            | HayaError::ToolPolicyDenied { .. }
            | HayaError::CorruptSession { .. }
            | HayaError::Io(_)
            | HayaError::Internal(_) => "INTERNAL",
        }
    }

    /// HTTP status equivalent for the HTTP shims.
    pub fn http_status(&self) -> u16 {
        match self.code() {
            "VALIDATION" => 422,
            "UNAUTHORIZED" => 401,
            "RATE_LIMITED" | "BUDGET_EXCEEDED" => 429,
            "NOT_FOUND" => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, HayaError>;
