//! Admin console authentication: password check and signed session tokens.
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Admin sessions last one day.
pub const TOKEN_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdminClaims {
    admin: bool,
    iat: i64,
    exp: i64,
}

/// Verifies the admin password and issues/validates HS256 session tokens.
/// Both secrets stay wrapped so they never end up in logs or debug output.
pub struct AuthUtils {
    admin_password: SecretString,
    jwt_secret: SecretString,
}

impl AuthUtils {
    pub fn new(admin_password: SecretString, jwt_secret: SecretString) -> Self {
        Self {
            admin_password,
            jwt_secret,
        }
    }

    /// Constant-time comparison against the configured admin password.
    pub fn verify_password(&self, candidate: &str) -> bool {
        let expected = self.admin_password.expose_secret().as_bytes();
        expected.ct_eq(candidate.as_bytes()).into()
    }

    /// Issue an admin token valid for [`TOKEN_EXPIRY_HOURS`] from `now`.
    pub fn issue_token(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = AdminClaims {
            admin: true,
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_EXPIRY_HOURS)).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.expose_secret().as_bytes()),
        )
        .context("Failed to sign admin token")
    }

    /// True only for an unexpired, correctly signed token carrying the admin claim.
    pub fn verify_token(&self, token: &str) -> bool {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match decode::<AdminClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.expose_secret().as_bytes()),
            &validation,
        ) {
            Ok(data) => data.claims.admin,
            Err(e) => {
                log::debug!("verify_token: rejected token: {}", e);
                false
            }
        }
    }
}
