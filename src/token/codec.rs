//! Token Codec: HMAC-signed, time-boxed session tokens
//!
//! A token proves that its holder obtained it from someone holding the
//! session secret within the last TTL window:
//! 1. The minter picks a random nonce and stamps the current time
//! 2. signature = HMAC-SHA256(secret, type|sessionId|subjectId|issuedAt|nonce)
//! 3. The verifier recomputes the HMAC and compares in constant time
//!
//! Authority tokens are shown by the teacher for check-in; participant
//! tokens are shown by students and scanned by their peers.

use crate::clock::Clock;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Who a token speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Minted for the session authority (teacher), consumed by check-in
    Authority,
    /// Minted for a student, consumed by peer scans
    Participant,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Authority => "authority",
            TokenKind::Participant => "participant",
        }
    }
}

/// A signed session token. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub session_id: String,
    pub subject_id: String,
    /// Milliseconds since the Unix epoch
    pub issued_at: i64,
    pub nonce: String,
    pub signature: String,
}

impl Token {
    /// Canonical message covered by the signature
    pub fn signing_message(
        kind: TokenKind,
        session_id: &str,
        subject_id: &str,
        issued_at: i64,
        nonce: &str,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            kind.as_str(),
            session_id,
            subject_id,
            issued_at,
            nonce
        )
    }

    /// Compact JSON payload for QR display
    pub fn to_payload(&self) -> Result<String, TokenError> {
        serde_json::to_string(self).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    /// Parse a scanned QR payload
    pub fn from_payload(payload: &str) -> Result<Self, TokenError> {
        serde_json::from_str(payload.trim()).map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

/// What the consumer of a token requires beyond a valid signature
#[derive(Debug, Clone)]
pub struct TokenExpectation<'a> {
    pub kind: TokenKind,
    pub session_id: &'a str,
    /// Required subject, if the caller knows it
    pub subject_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token signature does not match")]
    SignatureMismatch,

    #[error("token expired: issued {age_ms}ms ago, ttl {ttl_ms}ms")]
    Expired { age_ms: i64, ttl_ms: i64 },

    #[error("wrong token type: expected {expected:?}, got {actual:?}")]
    TypeMismatch { expected: TokenKind, actual: TokenKind },

    #[error("token is scoped to session {actual}, not {expected}")]
    ScopeMismatch { expected: String, actual: String },

    #[error("token subject {actual} does not match {expected}")]
    SubjectMismatch { expected: String, actual: String },

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Mints and verifies tokens against an injected clock
#[derive(Clone)]
pub struct TokenCodec {
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(ttl_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self { ttl_ms, clock }
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    /// Mint a fresh token stamped with the current time
    pub fn mint(
        &self,
        kind: TokenKind,
        session_id: &str,
        subject_id: &str,
        secret: &str,
    ) -> Result<Token, TokenError> {
        self.mint_at(kind, session_id, subject_id, secret, self.clock.now_ms())
    }

    /// Mint a token with an explicit issue time
    pub fn mint_at(
        &self,
        kind: TokenKind,
        session_id: &str,
        subject_id: &str,
        secret: &str,
        issued_at: i64,
    ) -> Result<Token, TokenError> {
        let nonce_bytes: [u8; 16] = rand::random();
        let nonce = hex::encode(nonce_bytes);
        let message = Token::signing_message(kind, session_id, subject_id, issued_at, &nonce);
        let signature = hex::encode(compute_mac(secret, &message)?);

        Ok(Token {
            kind,
            session_id: session_id.to_string(),
            subject_id: subject_id.to_string(),
            issued_at,
            nonce,
            signature,
        })
    }

    /// Check signature and freshness only
    pub fn verify(&self, token: &Token, secret: &str) -> Result<(), TokenError> {
        let message = Token::signing_message(
            token.kind,
            &token.session_id,
            &token.subject_id,
            token.issued_at,
            &token.nonce,
        );
        let expected = compute_mac(secret, &message)?;
        let presented =
            hex::decode(&token.signature).map_err(|_| TokenError::SignatureMismatch)?;
        if presented.len() != expected.len() || !bool::from(presented.ct_eq(expected.as_slice())) {
            return Err(TokenError::SignatureMismatch);
        }

        let age_ms = self.clock.now_ms() - token.issued_at;
        // Future-dated tokens beyond the window are clock skew or forgery
        if age_ms > self.ttl_ms || age_ms < -self.ttl_ms {
            return Err(TokenError::Expired {
                age_ms,
                ttl_ms: self.ttl_ms,
            });
        }
        Ok(())
    }

    /// Full check: signature, freshness, type, session scope and subject
    pub fn verify_expecting(
        &self,
        token: &Token,
        secret: &str,
        expect: &TokenExpectation<'_>,
    ) -> Result<(), TokenError> {
        self.verify(token, secret)?;
        if token.kind != expect.kind {
            return Err(TokenError::TypeMismatch {
                expected: expect.kind,
                actual: token.kind,
            });
        }
        if token.session_id != expect.session_id {
            return Err(TokenError::ScopeMismatch {
                expected: expect.session_id.to_string(),
                actual: token.session_id.clone(),
            });
        }
        if let Some(subject) = expect.subject_id {
            if token.subject_id != subject {
                return Err(TokenError::SubjectMismatch {
                    expected: subject.to_string(),
                    actual: token.subject_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Fresh 32-byte session secret, hex-encoded
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

fn compute_mac(secret: &str, message: &str) -> Result<Vec<u8>, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TokenError::Malformed(format!("invalid secret: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
