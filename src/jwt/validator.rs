//! Bearer credential verification
//!
//! Parses the compact JWS form, verifies the signature against the single
//! configured algorithm, and validates claims: validity window with clock
//! skew leeway, required subject and token id, and the optional issuer,
//! audience, and capability checks.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::keys::{Algorithm, KeyMaterial};
use crate::error::{AuthzError, Result};

/// Standard JWT claims
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Claims {
    /// Subject (user ID)
    #[serde(default)]
    pub sub: Option<String>,

    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,

    /// Audience (can be string or array)
    #[serde(default)]
    pub aud: Option<Audience>,

    /// Expiration time (Unix timestamp)
    #[serde(default)]
    pub exp: Option<u64>,

    /// Not before time (Unix timestamp)
    #[serde(default)]
    pub nbf: Option<u64>,

    /// Issued at time (Unix timestamp)
    #[serde(default)]
    pub iat: Option<u64>,

    /// JWT ID, the revocation key
    #[serde(default)]
    pub jti: Option<String>,

    /// Whitespace-separated capability tokens
    #[serde(default)]
    pub scope: Option<String>,

    /// Identity-provider label, passed through to the upstream service
    #[serde(default)]
    pub provider: Option<String>,

    /// All remaining claims
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Audience claim (can be string or array)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience
    Single(String),
    /// Multiple audiences
    Multiple(Vec<String>),
}

impl Audience {
    /// Check if the audience contains a specific value
    pub fn contains(&self, aud: &str) -> bool {
        match self {
            Audience::Single(s) => s == aud,
            Audience::Multiple(v) => v.iter().any(|a| a == aud),
        }
    }
}

/// A credential that passed signature and claim validation
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Validated claims
    pub claims: Claims,
    /// Algorithm the token was signed with
    pub alg: Algorithm,
}

impl VerifiedToken {
    /// The subject claim, trimmed. Guaranteed non-empty by validation.
    pub fn subject(&self) -> &str {
        self.claims.sub.as_deref().unwrap_or_default().trim()
    }

    /// The token id claim, trimmed. Guaranteed non-empty by validation.
    pub fn token_id(&self) -> &str {
        self.claims.jti.as_deref().unwrap_or_default().trim()
    }

    /// The identity-provider label, empty if absent
    pub fn provider(&self) -> &str {
        self.claims.provider.as_deref().unwrap_or_default()
    }
}

/// JWS header
#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    #[allow(dead_code)]
    typ: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    kid: Option<String>,
}

/// Verifier configuration, fixed at construction
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// The single accepted signature algorithm
    pub algorithm: Algorithm,
    /// Expected issuer; `None` disables the check
    pub issuer: Option<String>,
    /// Expected audience; `None` disables the check
    pub audience: Option<String>,
    /// Symmetric clock skew leeway in seconds
    pub clock_skew: u64,
    /// Capability that must appear in the `scope` claim; `None` disables
    /// the check
    pub required_capability: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::HS256,
            issuer: None,
            audience: None,
            clock_skew: 60,
            required_capability: None,
        }
    }
}

/// Credential verifier. Immutable after construction and safe to share
/// across concurrent request tasks.
#[derive(Debug)]
pub struct TokenVerifier {
    config: VerifierConfig,
    key: KeyMaterial,
}

impl TokenVerifier {
    /// Create a verifier from configuration and key material
    pub fn new(config: VerifierConfig, key: KeyMaterial) -> Self {
        Self { config, key }
    }

    /// The configured algorithm
    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    /// Verify a raw credential, optionally prefixed with `Bearer `
    ///
    /// Validates, in order:
    /// - compact JWS structure and header algorithm (must equal the
    ///   configured one, before any signature work)
    /// - signature
    /// - `exp`/`nbf`/`iat` against the leeway-widened window
    /// - non-empty `sub` and `jti`
    /// - issuer, audience, and required capability when configured
    pub fn verify(&self, raw: &str) -> Result<VerifiedToken> {
        let token = strip_bearer(raw.trim());

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthzError::invalid_token("invalid token format"));
        }
        let (header_b64, payload_b64, signature_b64) = (parts[0], parts[1], parts[2]);

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|e| AuthzError::invalid_token(format!("invalid header encoding: {e}")))?;
        let header: JwsHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthzError::invalid_token(format!("invalid header: {e}")))?;

        // Header algorithm must match the configured one exactly; checked
        // before touching the signature so an attacker cannot steer key
        // interpretation (e.g. HS256 against an RSA public key).
        if header.alg != self.config.algorithm.as_str() {
            debug!(
                advertised = %header.alg,
                configured = %self.config.algorithm,
                "rejecting token with unexpected algorithm"
            );
            return Err(AuthzError::invalid_token(format!(
                "unexpected algorithm: {}",
                header.alg
            )));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthzError::invalid_token(format!("invalid signature encoding: {e}")))?;
        let message = format!("{header_b64}.{payload_b64}");
        self.key
            .verify(self.config.algorithm, message.as_bytes(), &signature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| AuthzError::invalid_token(format!("invalid payload encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&payload_bytes)
            .map_err(|e| AuthzError::invalid_token(format!("invalid payload: {e}")))?;

        self.validate_claims(&claims)?;

        Ok(VerifiedToken {
            claims,
            alg: self.config.algorithm,
        })
    }

    fn validate_claims(&self, claims: &Claims) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let leeway = self.config.clock_skew;

        if let Some(exp) = claims.exp {
            if now > exp + leeway {
                debug!(exp, now, "token expired");
                return Err(AuthzError::invalid_token("token expired"));
            }
        }

        if let Some(nbf) = claims.nbf {
            if now + leeway < nbf {
                debug!(nbf, now, "token not yet valid");
                return Err(AuthzError::invalid_token("token not yet valid"));
            }
        }

        if let Some(iat) = claims.iat {
            if now + leeway < iat {
                debug!(iat, now, "token issued in the future");
                return Err(AuthzError::invalid_token("token issued in the future"));
            }
        }

        if claims.sub.as_deref().unwrap_or_default().trim().is_empty() {
            return Err(AuthzError::invalid_token("missing sub claim"));
        }
        if claims.jti.as_deref().unwrap_or_default().trim().is_empty() {
            return Err(AuthzError::invalid_token("missing jti claim"));
        }

        if let Some(expected) = &self.config.issuer {
            match claims.iss.as_deref().map(str::trim) {
                Some(iss) if iss == expected => {}
                Some(iss) => {
                    debug!(expected = %expected, actual = %iss, "issuer mismatch");
                    return Err(AuthzError::invalid_token("invalid issuer"));
                }
                None => return Err(AuthzError::invalid_token("missing issuer claim")),
            }
        }

        if let Some(expected) = &self.config.audience {
            match &claims.aud {
                Some(aud) if aud.contains(expected) => {}
                Some(_) => return Err(AuthzError::invalid_token("invalid audience")),
                None => return Err(AuthzError::invalid_token("missing audience claim")),
            }
        }

        if let Some(capability) = &self.config.required_capability {
            let granted = claims
                .scope
                .as_deref()
                .unwrap_or_default()
                .split_ascii_whitespace()
                .any(|s| s == capability);
            if !granted {
                return Err(AuthzError::invalid_token(format!(
                    "missing required capability: {capability}"
                )));
            }
        }

        Ok(())
    }
}

/// Trim exactly one `Bearer ` prefix, case-insensitively
fn strip_bearer(raw: &str) -> &str {
    const PREFIX: &str = "bearer ";
    match raw.split_at_checked(PREFIX.len()) {
        Some((head, rest)) if head.eq_ignore_ascii_case(PREFIX) => rest.trim_start(),
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_lc_rs::hmac;
    use serde_json::json;

    const SECRET: &str = "secret";

    fn verifier(config: VerifierConfig) -> TokenVerifier {
        let key = KeyMaterial::from_config(config.algorithm, Some(SECRET), None).unwrap();
        TokenVerifier::new(config, key)
    }

    fn eco2_verifier() -> TokenVerifier {
        verifier(VerifierConfig {
            issuer: Some("eco2".to_string()),
            audience: Some("api".to_string()),
            ..Default::default()
        })
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Mint a compact JWS with the given header and payload, HMAC-signed
    /// with the test secret.
    fn mint(header: &Value, payload: &Value) -> String {
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        let message = format!("{header_b64}.{payload_b64}");
        let key = hmac::Key::new(hmac::HMAC_SHA256, SECRET.as_bytes());
        let tag = hmac::sign(&key, message.as_bytes());
        format!("{message}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn mint_hs256(payload: &Value) -> String {
        mint(&json!({"alg": "HS256", "typ": "JWT"}), payload)
    }

    fn base_payload() -> Value {
        json!({
            "sub": "u1",
            "jti": "j1",
            "iss": "eco2",
            "aud": "api",
            "exp": now_secs() + 3600,
        })
    }

    #[test]
    fn test_valid_token_accepted() {
        let token = mint_hs256(&base_payload());
        let verified = eco2_verifier().verify(&token).expect("token should verify");
        assert_eq!(verified.subject(), "u1");
        assert_eq!(verified.token_id(), "j1");
        assert_eq!(verified.provider(), "");
    }

    #[test]
    fn test_bearer_prefix_trimmed() {
        let token = mint_hs256(&base_payload());
        let v = eco2_verifier();
        assert!(v.verify(&format!("Bearer {token}")).is_ok());
        assert!(v.verify(&format!("bearer {token}")).is_ok());
        assert!(v.verify(&format!("BEARER {token}")).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = mint_hs256(&base_payload());
        let parts: Vec<&str> = token.split('.').collect();
        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "sub": "admin", "jti": "j1", "iss": "eco2", "aud": "api",
                "exp": now_secs() + 3600,
            }))
            .unwrap(),
        );
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);
        assert!(eco2_verifier().verify(&forged).is_err());
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let v = eco2_verifier();
        assert!(v.verify("").is_err());
        assert!(v.verify("only.two").is_err());
        assert!(v.verify("not!base64.not!base64.not!base64").is_err());
        assert!(v.verify("Bearer ").is_err());
    }

    #[test]
    fn test_algorithm_substitution_rejected() {
        // Correctly HMAC-signed, but the header advertises RS256. The
        // verifier must reject on the header alone, never trying the
        // configured key under a different interpretation.
        let token = mint(&json!({"alg": "RS256", "typ": "JWT"}), &base_payload());
        let err = eco2_verifier().verify(&token).unwrap_err();
        assert!(err.to_string().contains("unexpected algorithm"));

        let none = mint(&json!({"alg": "none", "typ": "JWT"}), &base_payload());
        assert!(eco2_verifier().verify(&none).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut payload = base_payload();
        payload["exp"] = json!(now_secs() - 120);
        let token = mint_hs256(&payload);
        assert!(eco2_verifier().verify(&token).is_err());
    }

    #[test]
    fn test_expiry_leeway_applied() {
        // Expired 10 s ago, but within the default 60 s leeway
        let mut payload = base_payload();
        payload["exp"] = json!(now_secs() - 10);
        let token = mint_hs256(&payload);
        assert!(eco2_verifier().verify(&token).is_ok());
    }

    #[test]
    fn test_not_yet_valid_rejected() {
        let mut payload = base_payload();
        payload["nbf"] = json!(now_secs() + 300);
        let token = mint_hs256(&payload);
        assert!(eco2_verifier().verify(&token).is_err());
    }

    #[test]
    fn test_nbf_leeway_applied() {
        let mut payload = base_payload();
        payload["nbf"] = json!(now_secs() + 10);
        let token = mint_hs256(&payload);
        assert!(eco2_verifier().verify(&token).is_ok());
    }

    #[test]
    fn test_missing_sub_or_jti_rejected() {
        let v = eco2_verifier();

        let mut no_sub = base_payload();
        no_sub.as_object_mut().unwrap().remove("sub");
        assert!(v.verify(&mint_hs256(&no_sub)).is_err());

        let mut blank_sub = base_payload();
        blank_sub["sub"] = json!("   ");
        assert!(v.verify(&mint_hs256(&blank_sub)).is_err());

        let mut no_jti = base_payload();
        no_jti.as_object_mut().unwrap().remove("jti");
        assert!(v.verify(&mint_hs256(&no_jti)).is_err());

        let mut empty_jti = base_payload();
        empty_jti["jti"] = json!("");
        assert!(v.verify(&mint_hs256(&empty_jti)).is_err());
    }

    #[test]
    fn test_issuer_mismatch_rejected() {
        let mut payload = base_payload();
        payload["iss"] = json!("wrong");
        assert!(eco2_verifier().verify(&mint_hs256(&payload)).is_err());
    }

    #[test]
    fn test_issuer_whitespace_trimmed() {
        let mut payload = base_payload();
        payload["iss"] = json!("  eco2  ");
        assert!(eco2_verifier().verify(&mint_hs256(&payload)).is_ok());
    }

    #[test]
    fn test_issuer_check_disabled_when_unconfigured() {
        let v = verifier(VerifierConfig::default());
        let mut payload = base_payload();
        payload["iss"] = json!("anyone");
        assert!(v.verify(&mint_hs256(&payload)).is_ok());
    }

    #[test]
    fn test_audience_set_membership() {
        let v = eco2_verifier();

        let mut payload = base_payload();
        payload["aud"] = json!(["a", "b", "api"]);
        assert!(v.verify(&mint_hs256(&payload)).is_ok());

        payload["aud"] = json!(["a", "b", "c"]);
        assert!(v.verify(&mint_hs256(&payload)).is_err());

        payload["aud"] = json!("api");
        assert!(v.verify(&mint_hs256(&payload)).is_ok());

        payload["aud"] = json!("other");
        assert!(v.verify(&mint_hs256(&payload)).is_err());
    }

    #[test]
    fn test_missing_audience_rejected_when_expected() {
        let mut payload = base_payload();
        payload.as_object_mut().unwrap().remove("aud");
        assert!(eco2_verifier().verify(&mint_hs256(&payload)).is_err());
    }

    #[test]
    fn test_required_capability() {
        let v = verifier(VerifierConfig {
            issuer: Some("eco2".to_string()),
            audience: Some("api".to_string()),
            required_capability: Some("orders:write".to_string()),
            ..Default::default()
        });

        let mut payload = base_payload();
        payload["scope"] = json!("orders:read orders:write profile");
        assert!(v.verify(&mint_hs256(&payload)).is_ok());

        payload["scope"] = json!("orders:read profile");
        assert!(v.verify(&mint_hs256(&payload)).is_err());

        // Exact, case-sensitive element match
        payload["scope"] = json!("Orders:Write");
        assert!(v.verify(&mint_hs256(&payload)).is_err());

        payload["scope"] = json!("orders:writer");
        assert!(v.verify(&mint_hs256(&payload)).is_err());

        payload.as_object_mut().unwrap().remove("scope");
        assert!(v.verify(&mint_hs256(&payload)).is_err());
    }

    #[test]
    fn test_provider_claim_passthrough() {
        let mut payload = base_payload();
        payload["provider"] = json!("google");
        let verified = eco2_verifier().verify(&mint_hs256(&payload)).unwrap();
        assert_eq!(verified.provider(), "google");
    }

    #[test]
    fn test_audience_contains() {
        let single = Audience::Single("api".to_string());
        assert!(single.contains("api"));
        assert!(!single.contains("other"));

        let multiple = Audience::Multiple(vec!["api".to_string(), "web".to_string()]);
        assert!(multiple.contains("api"));
        assert!(multiple.contains("web"));
        assert!(!multiple.contains("other"));
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer abc"), "abc");
        // Only one prefix is trimmed
        assert_eq!(strip_bearer("Bearer Bearer abc"), "Bearer abc");
        assert_eq!(strip_bearer("abc"), "abc");
        assert_eq!(strip_bearer("Bearers"), "Bearers");
    }
}
