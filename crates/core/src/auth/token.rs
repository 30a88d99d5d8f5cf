//! Claim tokens for extending a federated identity onto another node.
//!
//! The signer/verifier is deliberately opaque to the rest of the daemon:
//! everything upstream handles a token as an untyped string and a
//! verified `Claim`. The shipped implementation signs HS256 JWTs with a
//! per-daemon secret; tests substitute a deterministic fake.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How long an unclaimed token stays valid.
const CLAIM_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token could not be issued: {0}")]
    Issue(String),
    #[error("token rejected")]
    Rejected,
    #[error("signer key unavailable: {0}")]
    Key(#[from] std::io::Error),
}

/// What a verified claim token asserts: which identity it extends and
/// which one-time claim slot it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub fed_id: String,
    pub jti: String,
}

pub trait ClaimTokens: Send + Sync {
    fn issue(&self, claim: &Claim) -> Result<String, TokenError>;
    fn verify(&self, token: &str) -> Result<Claim, TokenError>;
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    sub: String,
    jti: String,
    iat: u64,
    exp: u64,
}

pub struct JwtClaimTokens {
    encoding: jsonwebtoken::EncodingKey,
    decoding: jsonwebtoken::DecodingKey,
}

impl JwtClaimTokens {
    pub fn from_secret(secret: &[u8]) -> JwtClaimTokens {
        JwtClaimTokens {
            encoding: jsonwebtoken::EncodingKey::from_secret(secret),
            decoding: jsonwebtoken::DecodingKey::from_secret(secret),
        }
    }

    /// Load the daemon secret, generating one on first start. The file
    /// is owner-readable only; the secret never leaves the data dir.
    pub fn load_or_generate(path: &Path) -> Result<JwtClaimTokens, TokenError> {
        let secret = match std::fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(path, &bytes)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                }
                log::info!("generated new claim-token secret at {}", path.display());
                bytes
            }
        };
        Ok(JwtClaimTokens::from_secret(&secret))
    }
}

impl ClaimTokens for JwtClaimTokens {
    fn issue(&self, claim: &Claim) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let payload = TokenPayload {
            sub: claim.fed_id.clone(),
            jti: claim.jti.clone(),
            iat: now,
            exp: now + CLAIM_TOKEN_TTL_SECS,
        };
        jsonwebtoken::encode(&jsonwebtoken::Header::default(), &payload, &self.encoding)
            .map_err(|e| TokenError::Issue(e.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claim, TokenError> {
        let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = jsonwebtoken::decode::<TokenPayload>(token, &self.decoding, &validation)
            .map_err(|_| TokenError::Rejected)?;
        Ok(Claim {
            fed_id: data.claims.sub,
            jti: data.claims.jti,
        })
    }
}

/// Mint a fresh one-time claim id.
pub fn new_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
