//! Credentials
//!
//! The feed and the analysis endpoints both expect a short-lived bearer
//! token. How the token is obtained is up to the caller: a `TokenProvider`
//! is asked for a fresh one before every connection attempt and every
//! request, so providers must be cheap to call and must not cache a token
//! past its lifetime.

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Possible errors when obtaining a credential
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// There is no authenticated principal.
    #[error("not authenticated")]
    Unauthenticated,
    /// The source returned an empty credential.
    #[error("credential is empty")]
    Empty,
    /// The credential source could not be read.
    #[error("credential source unavailable: {0}")]
    Source(#[from] io::Error),
}

/// A non-empty bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Result<Token, AuthError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(AuthError::Empty)
        } else {
            Ok(Token(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

/// Source of bearer credentials.
pub trait TokenProvider {
    fn token(&self) -> Result<Token, AuthError>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Result<Token, AuthError>,
{
    fn token(&self) -> Result<Token, AuthError> {
        self()
    }
}

/// `Authorization` header value, or None if no usable credential is available.
pub fn auth_header<P: TokenProvider + ?Sized>(provider: &P) -> Option<String> {
    provider.token().ok().map(|t| t.bearer())
}

/// Always returns the same credential, or none at all.
#[derive(Clone, Debug)]
pub struct StaticToken(Option<Token>);

impl StaticToken {
    pub fn new(token: Token) -> StaticToken {
        StaticToken(Some(token))
    }

    pub fn anonymous() -> StaticToken {
        StaticToken(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<Token, AuthError> {
        self.0.clone().ok_or(AuthError::Unauthenticated)
    }
}

/// Reads the credential from an environment variable on every call.
#[derive(Clone, Debug)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: &str) -> EnvToken {
        EnvToken {
            var: var.to_string(),
        }
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Result<Token, AuthError> {
        match env::var(&self.var) {
            Ok(value) => Token::new(value),
            Err(_) => Err(AuthError::Unauthenticated),
        }
    }
}

/// Reads the credential from a file on every call, so that an external
/// agent can rotate it in place.
#[derive(Clone, Debug)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> FileToken {
        FileToken { path: path.into() }
    }
}

impl TokenProvider for FileToken {
    fn token(&self) -> Result<Token, AuthError> {
        let contents = fs::read_to_string(&self.path)?;
        Token::new(contents.trim())
    }
}
