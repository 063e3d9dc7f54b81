//! HS256 token verification.
//!
//! Decoding/signature checks are delegated to `jsonwebtoken`; the time-window
//! check is the deterministic `validate_claims` so it stays testable with a
//! pinned clock. The claims model uses RFC3339 timestamps rather than numeric
//! `exp`/`iat`, so the library's own registered-claim validation is disabled.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use thiserror::Error;

use crate::claims::{JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token decode failed: {0}")]
    Decode(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Token validation boundary used by the HTTP middleware.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError>;
}

/// Symmetric HS256 validator.
pub struct Hs256JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: Vec<u8>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time-window checks run against our own claims fields, and the
        // claims model carries no registered exp/aud claims.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            key: DecodingKey::from_secret(&secret),
            validation,
        }
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, JwtError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PrincipalId, Role};
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header};
    use pulse_core::TenantId;

    fn mint(secret: &[u8], issued: DateTime<Utc>, expires: DateTime<Utc>) -> String {
        let claims = JwtClaims {
            sub: PrincipalId::new(),
            tenant_id: TenantId::new(),
            roles: vec![Role::new("admin")],
            issued_at: issued,
            expires_at: expires,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let now = Utc::now();
        let token = mint(b"secret", now - Duration::minutes(1), now + Duration::minutes(10));
        let validator = Hs256JwtValidator::new(b"secret".to_vec());
        let claims = validator.validate(&token, now).unwrap();
        assert_eq!(claims.roles[0].as_str(), "admin");
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = Utc::now();
        let token = mint(b"secret", now, now + Duration::minutes(10));
        let validator = Hs256JwtValidator::new(b"other".to_vec());
        assert!(matches!(
            validator.validate(&token, now),
            Err(JwtError::Decode(_))
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let now = Utc::now();
        let token = mint(
            b"secret",
            now - Duration::minutes(20),
            now - Duration::minutes(5),
        );
        let validator = Hs256JwtValidator::new(b"secret".to_vec());
        assert!(matches!(
            validator.validate(&token, now),
            Err(JwtError::Claims(TokenValidationError::Expired))
        ));
    }
}
