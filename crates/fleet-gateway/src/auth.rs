//! [`TokenValidator`] – JWT verification against an external public key.
//!
//! The gateway never issues tokens.  It only checks the signature, the
//! expiry and (when configured) issuer and audience of tokens minted by the
//! identity service, and extracts the [`Claims`] it needs.
//!
//! Supported key families:
//!
//! | `algorithm` | Key |
//! |---|---|
//! | `EdDSA` | Ed25519 public key, PEM |
//! | `RS256`/`RS384`/`RS512`/`PS256`/`PS384`/`PS512` | RSA public key, PEM |
//! | `ES256`/`ES384` | EC public key, PEM |
//!
//! HMAC algorithms are refused: they would require the gateway to hold the
//! signing secret.

use std::str::FromStr;

use fleet_types::GatewayError;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Claims the gateway reads from a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    pub exp: u64,
    /// Operator role (`admin`, `supervisor`, `operator`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Build a validator from a PEM-encoded public key.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] for HMAC algorithms or an unreadable key.
    pub fn from_pem(pem: &[u8], algorithm: Algorithm) -> Result<Self, GatewayError> {
        let key = match algorithm {
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                return Err(GatewayError::Config(format!(
                    "{algorithm:?} needs a shared secret; configure a public-key algorithm"
                )));
            }
        }
        .map_err(|e| GatewayError::Config(format!("invalid {algorithm:?} public key: {e}")))?;

        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        Ok(Self { key, validation })
    }

    /// Build a validator from the `[auth]` section.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when no key path is configured, the algorithm
    /// is unknown, or the key cannot be read.
    pub fn from_config(config: &AuthConfig) -> Result<Self, GatewayError> {
        let path = config.public_key_path.as_ref().ok_or_else(|| {
            GatewayError::Config("auth.public_key_path is required".to_string())
        })?;
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            GatewayError::Config(format!("unknown JWT algorithm '{}'", config.algorithm))
        })?;
        let pem = std::fs::read(path).map_err(|e| {
            GatewayError::Config(format!("cannot read public key {}: {e}", path.display()))
        })?;

        let mut validator = Self::from_pem(&pem, algorithm)?.with_leeway(config.leeway_secs);
        if let Some(issuer) = &config.issuer {
            validator = validator.with_issuer(issuer);
        }
        if let Some(audience) = &config.audience {
            validator = validator.with_audience(audience);
        }
        Ok(validator)
    }

    /// Require the `iss` claim to equal `issuer` (builder-style).
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require the `aud` claim to contain `audience` (builder-style).
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Tolerated clock skew for `exp` (builder-style).
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.validation.leeway = seconds;
        self
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AuthFailed`] for a bad signature, an expired token,
    /// a wrong issuer or audience, or an empty subject.
    pub fn validate(&self, token: &str) -> Result<Claims, GatewayError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| GatewayError::AuthFailed(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(GatewayError::AuthFailed("token has an empty subject".to_string()));
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const PRIVATE_PEM: &[u8] = include_bytes!("../tests/fixtures/test_ed25519_private.pem");
    const PUBLIC_PEM: &[u8] = include_bytes!("../tests/fixtures/test_ed25519_public.pem");

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn sign(claims: serde_json::Value) -> String {
        let key = EncodingKey::from_ed_pem(PRIVATE_PEM).unwrap();
        encode(&Header::new(Algorithm::EdDSA), &claims, &key).unwrap()
    }

    fn validator() -> TokenValidator {
        TokenValidator::from_pem(PUBLIC_PEM, Algorithm::EdDSA).unwrap()
    }

    #[test]
    fn valid_token_yields_claims() {
        let token = sign(json!({ "sub": "alice", "exp": now() + 600, "role": "admin" }));
        let claims = validator().validate(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role.as_deref(), Some("admin"));
    }

    #[test]
    fn role_is_optional() {
        let token = sign(json!({ "sub": "bob", "exp": now() + 600 }));
        assert!(validator().validate(&token).unwrap().role.is_none());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = sign(json!({ "sub": "alice", "exp": now() - 3600 }));
        assert!(matches!(
            validator().validate(&token),
            Err(GatewayError::AuthFailed(_))
        ));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = sign(json!({ "sub": "alice", "exp": now() + 600 }));
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = sign(json!({ "sub": "mallory", "exp": now() + 600 }));
        let forged_payload = forged.split('.').nth(1).unwrap();
        parts[1] = forged_payload;
        let spliced = parts.join(".");
        assert!(validator().validate(&spliced).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(validator().validate("not-a-jwt").is_err());
    }

    #[test]
    fn issuer_is_enforced_when_configured() {
        let v = validator().with_issuer("fleet-backend");
        let good = sign(json!({ "sub": "a", "exp": now() + 600, "iss": "fleet-backend" }));
        let bad = sign(json!({ "sub": "a", "exp": now() + 600, "iss": "someone-else" }));
        assert!(v.validate(&good).is_ok());
        assert!(v.validate(&bad).is_err());
    }

    #[test]
    fn audience_is_enforced_when_configured() {
        let v = validator().with_audience("gateway");
        let good = sign(json!({ "sub": "a", "exp": now() + 600, "aud": "gateway" }));
        let bad = sign(json!({ "sub": "a", "exp": now() + 600, "aud": "billing" }));
        assert!(v.validate(&good).is_ok());
        assert!(v.validate(&bad).is_err());
    }

    #[test]
    fn hmac_algorithms_are_refused() {
        assert!(matches!(
            TokenValidator::from_pem(b"secret", Algorithm::HS256),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn from_config_requires_key_path() {
        let cfg = AuthConfig::default();
        assert!(matches!(
            TokenValidator::from_config(&cfg),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn from_config_reads_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jwt.pub");
        std::fs::write(&path, PUBLIC_PEM).unwrap();
        let cfg = AuthConfig {
            public_key_path: Some(path),
            ..AuthConfig::default()
        };
        let token = sign(json!({ "sub": "carol", "exp": now() + 600 }));
        let claims = TokenValidator::from_config(&cfg).unwrap().validate(&token).unwrap();
        assert_eq!(claims.sub, "carol");
    }
}
