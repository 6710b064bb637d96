use serde_json::json;
use thiserror::Error;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Failure of a server action, mapped onto a wire error code.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    BadParams(String),
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ActionError {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::BadParams(message.into())
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn rule(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &str) -> Self {
        Self::NotFound(format!("{entity} not found"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::Validation { .. } => "validation_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Forbidden(_) => "forbidden",
            Self::Unauthorized(_) => "unauthorized",
            Self::NoWorkspace => "no_workspace",
            Self::Db(_) => "db_failed",
            Self::Internal(_) => "internal",
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        let details = match &self {
            Self::Validation {
                field: Some(field), ..
            } => Some(json!({ "field": field })),
            _ => None,
        };
        let message = match &self {
            Self::Internal(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        err(id, self.code(), message, details)
    }
}
