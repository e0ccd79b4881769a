//! Auth on `$connect`
//!
//! A bearer token is validated against an RSA public key, confirming issuer,
//! expiry, and presence of `sub` (user) and `tenant_id`. Rejection
//! short-circuits with a 401-equivalent and no Connection is created.

use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::StreamerError;
use crate::metrics::{Metrics, NoopMetrics};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerClaims {
    pub sub: String,
    pub tenant_id: String,
    pub exp: i64,
    #[serde(default)]
    pub iss: Option<String>,
}

/// Validated identity extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: String,
}

pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
    metrics: Arc<dyn Metrics>,
}

impl Authenticator {
    /// `public_key_pem` is the RSA public key used to verify the token signature.
    pub fn from_rsa_pem(public_key_pem: &[u8], expected_issuer: Option<&str>) -> Result<Self, StreamerError> {
        Self::from_rsa_pem_with_metrics(public_key_pem, expected_issuer, Arc::new(NoopMetrics))
    }

    /// As `from_rsa_pem`, but records `auth_failure` on every rejection path.
    pub fn from_rsa_pem_with_metrics(
        public_key_pem: &[u8],
        expected_issuer: Option<&str>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, StreamerError> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| StreamerError::internal(format!("invalid RSA public key: {e}")))?;
        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(iss) = expected_issuer {
            validation.set_issuer(&[iss]);
        }
        Ok(Self {
            decoding_key,
            validation,
            metrics,
        })
    }

    /// Validate the bearer token supplied on `$connect` (query param or header).
    pub fn authenticate(&self, bearer_token: &str) -> Result<Identity, StreamerError> {
        let data = decode::<StreamerClaims>(bearer_token, &self.decoding_key, &self.validation).map_err(|e| {
            self.metrics.auth_failure();
            StreamerError::unauthorized(format!("token rejected: {e}"))
        })?;

        if data.claims.sub.is_empty() {
            self.metrics.auth_failure();
            return Err(StreamerError::unauthorized("token missing sub"));
        }
        if data.claims.tenant_id.is_empty() {
            self.metrics.auth_failure();
            return Err(StreamerError::unauthorized("token missing tenant_id"));
        }

        Ok(Identity {
            user_id: data.claims.sub,
            tenant_id: data.claims.tenant_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_private.pem");
    const PUBLIC_KEY: &str = include_str!("../tests/fixtures/test_rsa_public.pem");

    fn sign(claims: &StreamerClaims) -> String {
        let key = EncodingKey::from_rsa_pem(PRIVATE_KEY.as_bytes()).unwrap();
        encode(&Header::new(Algorithm::RS256), claims, &key).unwrap()
    }

    #[test]
    fn accepts_well_formed_token() {
        let auth = Authenticator::from_rsa_pem(PUBLIC_KEY.as_bytes(), None).unwrap();
        let token = sign(&StreamerClaims {
            sub: "user-1".into(),
            tenant_id: "tenant-1".into(),
            exp: (crate::registry::now_secs() + 3600),
            iss: None,
        });
        let identity = auth.authenticate(&token).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.tenant_id, "tenant-1");
    }

    #[test]
    fn rejects_expired_token() {
        let auth = Authenticator::from_rsa_pem(PUBLIC_KEY.as_bytes(), None).unwrap();
        let token = sign(&StreamerClaims {
            sub: "user-1".into(),
            tenant_id: "tenant-1".into(),
            exp: crate::registry::now_secs() - 3600,
            iss: None,
        });
        let err = auth.authenticate(&token).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Unauthorized);
    }

    #[test]
    fn rejects_missing_tenant_claim() {
        let auth = Authenticator::from_rsa_pem(PUBLIC_KEY.as_bytes(), None).unwrap();
        let token = sign(&StreamerClaims {
            sub: "user-1".into(),
            tenant_id: String::new(),
            exp: crate::registry::now_secs() + 3600,
            iss: None,
        });
        let err = auth.authenticate(&token).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Unauthorized);
    }

    #[derive(Default)]
    struct CountingMetrics {
        auth_failures: std::sync::atomic::AtomicUsize,
    }

    impl Metrics for CountingMetrics {
        fn auth_failure(&self) {
            self.auth_failures.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn rejection_paths_record_auth_failure() {
        let metrics = Arc::new(CountingMetrics::default());
        let auth =
            Authenticator::from_rsa_pem_with_metrics(PUBLIC_KEY.as_bytes(), None, metrics.clone()).unwrap();

        let expired = sign(&StreamerClaims {
            sub: "user-1".into(),
            tenant_id: "tenant-1".into(),
            exp: crate::registry::now_secs() - 3600,
            iss: None,
        });
        let missing_tenant = sign(&StreamerClaims {
            sub: "user-1".into(),
            tenant_id: String::new(),
            exp: crate::registry::now_secs() + 3600,
            iss: None,
        });
        assert!(auth.authenticate(&expired).is_err());
        assert!(auth.authenticate(&missing_tenant).is_err());
        assert!(auth.authenticate("not.a.jwt").is_err());

        assert_eq!(
            metrics.auth_failures.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
    }
}
