//! Standardized response formatting for the vote server.
//!
//! Every JSON body carries `success`; failures add `error` (human readable)
//! and `errorCode` (stable, for clients).

use crate::guard::{Denial, DenyReason};
use serde_json::{json, Map, Value};

/// Standardized error response codes
pub mod error_codes {
    pub const MISSING_FIELDS: &str = "MISSING_FIELDS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const BANNED: &str = "BANNED";
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Create a standardized error response body
pub fn error_response(code: &str, message: &str) -> Value {
    json!({
        "success": false,
        "errorCode": code,
        "error": message
    })
}

/// Create a standardized success response body; the fields of `data` are
/// merged next to `success`.
pub fn success_response(data: Value) -> Value {
    let mut body = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    body.insert("success".to_string(), Value::Bool(true));
    Value::Object(body)
}

/// Error code matching a guard denial.
pub fn denial_code(denial: &Denial) -> &'static str {
    match denial.reason {
        DenyReason::RateLimited => error_codes::RATE_LIMITED,
        DenyReason::Banned | DenyReason::BannedNow => error_codes::BANNED,
        DenyReason::StoreUnavailable => error_codes::SERVICE_UNAVAILABLE,
    }
}

/// User-facing message for a refused vote.
pub fn vote_denial_message(denial: &Denial) -> String {
    match denial.reason {
        DenyReason::RateLimited => format!(
            "Please wait {} seconds before voting again.",
            denial.retry_after_secs.unwrap_or(0)
        ),
        DenyReason::Banned => match denial.retry_after_secs {
            Some(secs) => format!(
                "You are banned from voting due to excessive activity. Try again in {}.",
                human_duration(secs)
            ),
            None => "You are banned from voting due to excessive activity.".to_string(),
        },
        DenyReason::BannedNow => format!(
            "You have been banned for {} due to suspicious activity.",
            human_duration(denial.retry_after_secs.unwrap_or(0))
        ),
        DenyReason::StoreUnavailable => {
            "Voting is temporarily unavailable. Please try again later.".to_string()
        }
    }
}

/// "12 hours", "5 minutes", "42 seconds": the largest whole unit, rounded up.
fn human_duration(secs: u64) -> String {
    let (value, unit) = if secs >= 3600 {
        (secs.div_ceil(3600), "hour")
    } else if secs >= 60 {
        (secs.div_ceil(60), "minute")
    } else {
        (secs, "second")
    };
    if value == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", value, unit)
    }
}
