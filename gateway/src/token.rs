//! Signed session tokens.
//!
//! Format: `base64url(claims JSON) . base64url(HMAC-SHA256(payload))`,
//! signed with the shared internal secret. Tokens are opaque to agents;
//! only the gateway mints and verifies them.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Default session token lifetime.
pub const SESSION_TOKEN_TTL: Duration = Duration::minutes(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    pub allowed_node_ids: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        #[allow(clippy::expect_used)]
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn issue(
        &self,
        run_id: &str,
        organization_id: Option<String>,
        allowed_node_ids: Vec<String>,
    ) -> Result<String, GatewayError> {
        let issued_at = Utc::now();
        let claims = SessionClaims {
            run_id: run_id.to_string(),
            organization_id,
            allowed_node_ids,
            issued_at,
            expires_at: issued_at + SESSION_TOKEN_TTL,
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|err| GatewayError::Internal(format!("claims serialization: {err}")))?;
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(encoded.as_bytes()));
        Ok(format!("{encoded}.{signature}"))
    }

    /// Validate signature and expiry; returns the claims on success.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, GatewayError> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or_else(|| GatewayError::Auth("malformed session token".to_string()))?;

        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| GatewayError::Auth("malformed token signature".to_string()))?;
        let expected = self.mac(encoded.as_bytes());
        if expected.ct_eq(&presented).unwrap_u8() != 1 {
            return Err(GatewayError::Auth("invalid token signature".to_string()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| GatewayError::Auth("malformed token payload".to_string()))?;
        let claims: SessionClaims = serde_json::from_slice(&payload)
            .map_err(|_| GatewayError::Auth("malformed token claims".to_string()))?;

        if claims.expires_at <= Utc::now() {
            return Err(GatewayError::Auth("session token expired".to_string()));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"internal-secret".to_vec())
    }

    #[test]
    fn issued_tokens_verify_and_carry_scope() {
        let signer = signer();
        let token = signer
            .issue(
                "run-1",
                Some("org-1".to_string()),
                vec!["node-a".to_string(), "node-b".to_string()],
            )
            .unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.run_id, "run-1");
        assert_eq!(claims.organization_id.as_deref(), Some("org-1"));
        assert_eq!(claims.allowed_node_ids, vec!["node-a", "node-b"]);
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let signer = signer();
        let token = signer.issue("run-1", None, vec![]).unwrap();
        let (payload, signature) = token.split_once('.').unwrap();

        // Replace the run id inside the payload.
        let mut claims: SessionClaims = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(payload).unwrap(),
        )
        .unwrap();
        claims.run_id = "run-2".to_string();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{forged_payload}.{signature}");

        assert!(matches!(
            signer.verify(&forged),
            Err(GatewayError::Auth(_))
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = signer().issue("run-1", None, vec![]).unwrap();
        let other = TokenSigner::new(b"different-secret".to_vec());
        assert!(matches!(other.verify(&token), Err(GatewayError::Auth(_))));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let signer = signer();
        // Hand-build expired claims signed with the real secret.
        let issued_at = Utc::now() - Duration::minutes(30);
        let claims = SessionClaims {
            run_id: "run-1".to_string(),
            organization_id: None,
            allowed_node_ids: vec![],
            issued_at,
            expires_at: issued_at + SESSION_TOKEN_TTL,
        };
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let signature = URL_SAFE_NO_PAD.encode(signer.mac(encoded.as_bytes()));
        let token = format!("{encoded}.{signature}");

        let err = signer.verify(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        for garbage in ["", "no-dot", "a.b.c", "!!.??"] {
            assert!(signer().verify(garbage).is_err(), "accepted `{garbage}`");
        }
    }
}
