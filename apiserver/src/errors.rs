use authz::principal::DirectoryError;
use authz::{AuthzError, ForbiddenReason};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use store::StoreError;
use store::types::IdError;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("request is missing a known user")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(ForbiddenReason),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::AlreadyExists(_) => "AlreadyExists",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Invalid(_) => "InvalidBodyContent",
            ApiError::Internal(_) => "ServerError",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StoreError::AlreadyExists { .. } => ApiError::AlreadyExists(e.to_string()),
            StoreError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StoreError::Invalid { .. } => ApiError::Invalid(e.to_string()),
        }
    }
}

impl From<AuthzError> for ApiError {
    fn from(e: AuthzError) -> Self {
        match e {
            AuthzError::Forbidden(reason) => ApiError::Forbidden(reason),
            AuthzError::Invalid(message) => ApiError::Invalid(message),
            AuthzError::Store(e) => e.into(),
            AuthzError::Directory(e) => e.into(),
        }
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::InvalidPrincipal(_) => ApiError::Invalid(e.to_string()),
            DirectoryError::Unavailable(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<IdError> for ApiError {
    fn from(e: IdError) -> Self {
        ApiError::Invalid(e.to_string())
    }
}

impl From<ForbiddenReason> for ApiError {
    fn from(reason: ForbiddenReason) -> Self {
        ApiError::Forbidden(reason)
    }
}

/// Body of every non-2xx response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(ErrorBody {
            status: status.as_u16(),
            code: self.code().to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::types::ProjectId;

    #[test]
    fn test_status_mapping() {
        let forbidden: ApiError = AuthzError::Forbidden(ForbiddenReason::NoRolesInProject {
            user: "u-1".into(),
            project: ProjectId::new("local", "p-1"),
        })
        .into();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            forbidden.to_string(),
            "user u-1 has no roles in target project local:p-1"
        );

        let conflict: ApiError = StoreError::Conflict {
            kind: "multiclusterapp",
            id: "cattle-global-data:wp".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let invalid: ApiError = AuthzError::Invalid("role template x not found".into()).into();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }
}
