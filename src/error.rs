use crate::guard::{Denial, DenyReason};
use crate::response::{denial_code, error_codes, error_response};
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid credentials")]
    InvalidCredentials { attempts_left: u32 },

    #[error("{message}")]
    Denied { denial: Denial, message: String },

    #[error("Too many failed login attempts. Try again in {retry_after_secs} seconds.")]
    LoginBlocked { retry_after_secs: u64 },

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized | ApiError::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Denied { denial, .. } => match denial.reason {
                DenyReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                DenyReason::Banned | DenyReason::BannedNow => StatusCode::FORBIDDEN,
                DenyReason::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::LoginBlocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::Denied { denial, .. } => denial.retry_after_secs,
            ApiError::LoginBlocked { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    fn body(&self) -> Value {
        let message = self.to_string();
        match self {
            ApiError::BadRequest(_) => error_response(error_codes::MISSING_FIELDS, &message),
            ApiError::NotFound(_) => error_response(error_codes::NOT_FOUND, &message),
            ApiError::Unauthorized => error_response(error_codes::UNAUTHORIZED, &message),
            ApiError::Forbidden => error_response(error_codes::FORBIDDEN, &message),
            ApiError::InvalidCredentials { attempts_left } => {
                let mut body = error_response(error_codes::INVALID_CREDENTIALS, &message);
                body["attemptsLeft"] = (*attempts_left).into();
                body
            }
            ApiError::Denied { denial, .. } => {
                let mut body = error_response(denial_code(denial), &message);
                if let Some(secs) = denial.retry_after_secs {
                    body["retryAfter"] = secs.into();
                }
                body
            }
            ApiError::LoginBlocked { retry_after_secs } => {
                let mut body = error_response(error_codes::RATE_LIMITED, &message);
                body["retryAfter"] = (*retry_after_secs).into();
                body["blockTime"] = (*retry_after_secs).into();
                body
            }
            ApiError::Internal(_) => error_response(error_codes::INTERNAL_ERROR, &message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            log::error!("request failed: {:#}", e);
        }

        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();

        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Decision;

    fn denied(decision: Decision) -> ApiError {
        ApiError::Denied {
            denial: *decision.denial().unwrap(),
            message: "no".to_string(),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(denied(Decision::rate_limited(5)).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied(Decision::banned(None)).status(), StatusCode::FORBIDDEN);
        assert_eq!(denied(Decision::store_unavailable()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_retry_after_header_and_body() {
        let response = denied(Decision::rate_limited(17)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "17");

        let body = denied(Decision::rate_limited(17)).body();
        assert_eq!(body["retryAfter"], 17);
        assert_eq!(body["errorCode"], "RATE_LIMITED");
    }

    #[test]
    fn test_internal_error_hides_details() {
        let body = ApiError::Internal(anyhow::anyhow!("disk I/O error at /var/data")).body();
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_login_blocked() {
        let response = ApiError::LoginBlocked { retry_after_secs: 120 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "120");

        let body = ApiError::LoginBlocked { retry_after_secs: 120 }.body();
        assert_eq!(body["blockTime"], 120);
        assert_eq!(
            body["error"],
            "Too many failed login attempts. Try again in 120 seconds."
        );
    }

    #[test]
    fn test_invalid_credentials_reports_attempts() {
        let body = ApiError::InvalidCredentials { attempts_left: 3 }.body();
        assert_eq!(body["attemptsLeft"], 3);
    }
}
