//! Signature algorithms and verification key material
//!
//! Exactly one algorithm is configured per deployment; the verifier rejects
//! any token whose header advertises a different one. Symmetric algorithms
//! take a shared secret, asymmetric ones a PEM `SubjectPublicKeyInfo`
//! public key.

use std::str::FromStr;

use aws_lc_rs::{hmac, signature};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{AuthzError, Result};

/// Supported JWS signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Algorithm {
    HS256,
    HS384,
    HS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
}

impl Algorithm {
    /// The algorithm name as it appears in a JWS header
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::HS384 => "HS384",
            Self::HS512 => "HS512",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
        }
    }

    /// Whether this algorithm uses a shared secret rather than a public key
    pub fn is_symmetric(&self) -> bool {
        matches!(self, Self::HS256 | Self::HS384 | Self::HS512)
    }
}

impl FromStr for Algorithm {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HS256" => Ok(Self::HS256),
            "HS384" => Ok(Self::HS384),
            "HS512" => Ok(Self::HS512),
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "RS512" => Ok(Self::RS512),
            "ES256" => Ok(Self::ES256),
            "ES384" => Ok(Self::ES384),
            other => Err(AuthzError::configuration(format!(
                "unsupported signature algorithm: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification key material matching the configured algorithm
pub enum KeyMaterial {
    /// HMAC key for HS256/HS384/HS512
    Hmac(hmac::Key),
    /// RSA public key in PKCS#1 DER form, as expected by aws-lc-rs
    RsaPkcs1(Vec<u8>),
    /// EC public key as an uncompressed point (0x04 || x || y)
    EcPoint(Vec<u8>),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key bytes in debug output
        match self {
            Self::Hmac(_) => f.write_str("KeyMaterial::Hmac(<redacted>)"),
            Self::RsaPkcs1(_) => f.write_str("KeyMaterial::RsaPkcs1(<redacted>)"),
            Self::EcPoint(_) => f.write_str("KeyMaterial::EcPoint(<redacted>)"),
        }
    }
}

impl KeyMaterial {
    /// Build key material for the given algorithm from the configured
    /// secret (symmetric) or PEM public key (asymmetric).
    pub fn from_config(
        algorithm: Algorithm,
        secret: Option<&str>,
        public_key_pem: Option<&str>,
    ) -> Result<Self> {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = secret.filter(|s| !s.is_empty()).ok_or_else(|| {
                    AuthzError::configuration(format!(
                        "{algorithm} requires a shared secret (JWT_SECRET)"
                    ))
                })?;
                let hmac_alg = match algorithm {
                    Algorithm::HS256 => hmac::HMAC_SHA256,
                    Algorithm::HS384 => hmac::HMAC_SHA384,
                    _ => hmac::HMAC_SHA512,
                };
                Ok(Self::Hmac(hmac::Key::new(hmac_alg, secret.as_bytes())))
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let pem = public_key_pem.filter(|s| !s.is_empty()).ok_or_else(|| {
                    AuthzError::configuration(format!(
                        "{algorithm} requires a PEM public key (JWT_PUBLIC_KEY)"
                    ))
                })?;
                Ok(Self::RsaPkcs1(spki_key_bytes(&decode_pem(pem)?)?))
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let pem = public_key_pem.filter(|s| !s.is_empty()).ok_or_else(|| {
                    AuthzError::configuration(format!(
                        "{algorithm} requires a PEM public key (JWT_PUBLIC_KEY)"
                    ))
                })?;
                Ok(Self::EcPoint(spki_key_bytes(&decode_pem(pem)?)?))
            }
        }
    }

    /// Verify a JWS signature over `message` with this key
    pub fn verify(&self, algorithm: Algorithm, message: &[u8], sig: &[u8]) -> Result<()> {
        match self {
            Self::Hmac(key) => hmac::verify(key, message, sig)
                .map_err(|_| AuthzError::invalid_token("signature verification failed")),
            Self::RsaPkcs1(der) => {
                let verify_alg: &dyn signature::VerificationAlgorithm = match algorithm {
                    Algorithm::RS256 => &signature::RSA_PKCS1_2048_8192_SHA256,
                    Algorithm::RS384 => &signature::RSA_PKCS1_2048_8192_SHA384,
                    Algorithm::RS512 => &signature::RSA_PKCS1_2048_8192_SHA512,
                    other => {
                        return Err(AuthzError::configuration(format!(
                            "RSA key cannot verify {other}"
                        )))
                    }
                };
                signature::UnparsedPublicKey::new(verify_alg, der)
                    .verify(message, sig)
                    .map_err(|_| AuthzError::invalid_token("signature verification failed"))
            }
            Self::EcPoint(point) => {
                let verify_alg: &dyn signature::VerificationAlgorithm = match algorithm {
                    Algorithm::ES256 => &signature::ECDSA_P256_SHA256_FIXED,
                    Algorithm::ES384 => &signature::ECDSA_P384_SHA384_FIXED,
                    other => {
                        return Err(AuthzError::configuration(format!(
                            "EC key cannot verify {other}"
                        )))
                    }
                };
                signature::UnparsedPublicKey::new(verify_alg, point)
                    .verify(message, sig)
                    .map_err(|_| AuthzError::invalid_token("signature verification failed"))
            }
        }
    }
}

/// Decode a PEM document to its DER payload
fn decode_pem(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("-----"))
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| AuthzError::configuration(format!("invalid PEM public key: {e}")))
}

/// Extract the key bytes from a DER `SubjectPublicKeyInfo`:
///
/// ```text
/// SubjectPublicKeyInfo ::= SEQUENCE {
///     algorithm         AlgorithmIdentifier,
///     subjectPublicKey  BIT STRING
/// }
/// ```
///
/// For RSA the bit string holds a PKCS#1 `RSAPublicKey`; for EC it holds
/// the uncompressed curve point. Both are exactly what aws-lc-rs expects.
fn spki_key_bytes(der: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let outer = read_element(der, &mut pos, 0x30)?;

    let mut inner_pos = 0;
    // AlgorithmIdentifier, skipped
    read_element(outer, &mut inner_pos, 0x30)?;
    let bit_string = read_element(outer, &mut inner_pos, 0x03)?;

    match bit_string.split_first() {
        Some((0, key)) if !key.is_empty() => Ok(key.to_vec()),
        _ => Err(AuthzError::configuration(
            "invalid public key: malformed BIT STRING",
        )),
    }
}

/// Read one DER element with the expected tag, returning its contents
fn read_element<'a>(data: &'a [u8], pos: &mut usize, tag: u8) -> Result<&'a [u8]> {
    let malformed = || AuthzError::configuration("invalid public key: malformed DER");

    if *pos >= data.len() || data[*pos] != tag {
        return Err(malformed());
    }
    *pos += 1;

    let first = *data.get(*pos).ok_or_else(malformed)?;
    *pos += 1;
    let len = if first < 0x80 {
        first as usize
    } else {
        let num_bytes = (first & 0x7f) as usize;
        if num_bytes == 0 || num_bytes > 2 {
            return Err(malformed());
        }
        let mut len = 0usize;
        for _ in 0..num_bytes {
            let b = *data.get(*pos).ok_or_else(malformed)?;
            *pos += 1;
            len = (len << 8) | b as usize;
        }
        len
    };

    let end = pos.checked_add(len).ok_or_else(malformed)?;
    if end > data.len() {
        return Err(malformed());
    }
    let content = &data[*pos..end];
    *pos = end;
    Ok(content)
}
