//! Bearer credential verification
//!
//! Single-algorithm JWT verification with HMAC or public-key signatures.

mod keys;
mod validator;

pub use keys::{Algorithm, KeyMaterial};
pub use validator::{Audience, Claims, TokenVerifier, VerifiedToken, VerifierConfig};
