//! Cryptographically secure random values
//!
//! Backed by aws-lc-rs so the broker draws every secret (session ids, PKCE
//! verifiers, anti-replay state) from a FIPS-validated generator.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::{Error, Result};

/// Fill a fresh buffer of `len` bytes from the system CSPRNG
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    aws_lc_rs::rand::fill(&mut buf).map_err(|_| Error::Entropy)?;
    Ok(buf)
}

/// Generate `len` random bytes encoded as unpadded URL-safe base64
pub fn random_token(len: usize) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(len)?))
}
