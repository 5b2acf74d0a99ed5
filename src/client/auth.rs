use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Service tokens are short-lived by design
const TOKEN_TTL_SECS: i64 = 60;
/// Tokens this close to expiry are re-minted instead of reused
const REFRESH_MARGIN_SECS: i64 = 10;

/// Claims of a signed service identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Name of the issuing service
    pub service: String,
    /// Issued-at, seconds since epoch
    pub iat: i64,
    /// Expiry, seconds since epoch
    pub exp: i64,
}

struct CachedToken {
    token: String,
    expires_at: i64,
}

/// Issues and verifies HS256 service identity tokens, caching one token per
/// service name until it nears expiry. Concurrent re-mints are harmless;
/// the last writer wins.
pub struct ServiceTokenSigner {
    encoding_key: Option<EncodingKey>,
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    cache: RwLock<HashMap<String, CachedToken>>,
}

impl ServiceTokenSigner {
    pub fn new(secret: &str, enabled: bool) -> Self {
        let active = enabled && !secret.is_empty();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;

        Self {
            encoding_key: active.then(|| EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: active.then(|| DecodingKey::from_secret(secret.as_bytes())),
            validation,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.encoding_key.is_some()
    }

    /// Signed token for `service`, from cache when still fresh.
    /// Returns `None` when signing is disabled.
    pub fn token(&self, service: &str) -> Result<Option<String>, jsonwebtoken::errors::Error> {
        let encoding_key = match &self.encoding_key {
            Some(key) => key,
            None => return Ok(None),
        };

        let now = Utc::now().timestamp();
        if let Some(cached) = self.cache.read().unwrap().get(service) {
            if cached.expires_at - now > REFRESH_MARGIN_SECS {
                return Ok(Some(cached.token.clone()));
            }
        }

        let claims = ServiceClaims {
            service: service.to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, encoding_key)?;
        debug!(service, "minted service token");
        self.cache.write().unwrap().insert(
            service.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: claims.exp,
            },
        );
        Ok(Some(token))
    }

    /// Verify an inbound token signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> Result<ServiceClaims, jsonwebtoken::errors::Error> {
        let decoding_key = match &self.decoding_key {
            Some(key) => key,
            None => return Err(jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into()),
        };
        Ok(decode::<ServiceClaims>(token, decoding_key, &self.validation)?.claims)
    }

    /// Drop all cached tokens.
    pub fn clear(&self) {
        self.cache.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_round_trip() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        let token = signer.token("portfolio").unwrap().unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.service, "portfolio");
        assert_eq!(claims.exp - claims.iat, TOKEN_TTL_SECS);
    }

    #[test]
    fn test_disabled_signer_issues_nothing() {
        let signer = ServiceTokenSigner::new("", true);
        assert!(!signer.enabled());
        assert!(signer.token("portfolio").unwrap().is_none());

        let signer = ServiceTokenSigner::new("secret", false);
        assert!(signer.token("portfolio").unwrap().is_none());
    }

    #[test]
    fn test_fresh_token_is_reused() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        let first = signer.token("portfolio").unwrap().unwrap();
        let second = signer.token("portfolio").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_token_near_expiry_is_regenerated() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        signer.cache.write().unwrap().insert(
            "portfolio".to_string(),
            CachedToken {
                token: "stale-token".to_string(),
                expires_at: Utc::now().timestamp() + REFRESH_MARGIN_SECS - 1,
            },
        );

        let token = signer.token("portfolio").unwrap().unwrap();
        assert_ne!(token, "stale-token");
        assert!(signer.verify(&token).is_ok());
    }

    #[test]
    fn test_cache_is_per_service_name() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        let a = signer.token("svc-a").unwrap().unwrap();
        let b = signer.token("svc-b").unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(signer.verify(&a).unwrap().service, "svc-a");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        let now = Utc::now().timestamp();
        let claims = ServiceClaims {
            service: "portfolio".to_string(),
            iat: now - 180,
            exp: now - 120,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            signer.encoding_key.as_ref().unwrap(),
        )
        .unwrap();

        let err = signer.verify(&token).unwrap_err();
        assert!(matches!(
            err.kind(),
            jsonwebtoken::errors::ErrorKind::ExpiredSignature
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        let other = ServiceTokenSigner::new("other-secret", true);
        let token = signer.token("portfolio").unwrap().unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_clear_drops_cached_tokens() {
        let signer = ServiceTokenSigner::new("test-secret", true);
        signer.token("portfolio").unwrap();
        signer.clear();
        assert!(signer.cache.read().unwrap().is_empty());
    }
}
