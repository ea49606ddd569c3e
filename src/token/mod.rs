//! Session tokens
//!
//! Short-lived HMAC credentials scoped to one session and one subject.

mod codec;

pub use codec::{generate_secret, Token, TokenCodec, TokenError, TokenExpectation, TokenKind};
