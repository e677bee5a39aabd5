//! Connection authentication.
//!
//! A connection presents a signed HS256 session token and addresses a
//! document by id. [`AuthVerifier::authenticate`] checks the token, resolves
//! the document and its owner, and returns the immutable [`CollabContext`]
//! that the sync hooks operate on.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{DocumentKind, DocumentRecord, DocumentRepository, StorageError, UserRecord};

/// Longest accepted document id
const MAX_DOCUMENT_NAME_LEN: usize = 128;

/// Errors raised while authenticating a connection
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,

    #[error("invalid document name: {0}")]
    InvalidDocumentName(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("user not authorized: {0}")]
    Unauthorized(String),

    #[error("user not found: {0}")]
    IdentityNotFound(String),

    #[error("lookup failed: {0}")]
    Lookup(#[from] StorageError),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingToken | AuthError::InvalidToken(_) | AuthError::Expired => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AuthError::DocumentNotFound(_) | AuthError::IdentityNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AuthError::InvalidDocumentName(_) => StatusCode::BAD_REQUEST,
            AuthError::Lookup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Session token payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id as issued by the account service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Standard subject claim, used when `uid` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Expiry (Unix timestamp)
    pub exp: u64,
}

impl Claims {
    pub fn for_user(uid: impl Into<String>, exp: u64) -> Self {
        Self {
            uid: Some(uid.into()),
            sub: None,
            email: None,
            exp,
        }
    }

    /// The identity the token speaks for
    pub fn subject(&self) -> Option<&str> {
        self.uid
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Identity and document bound to one connection for its whole lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct CollabContext {
    pub identity: UserRecord,
    pub document: DocumentRecord,
}

impl CollabContext {
    pub fn new(identity: UserRecord, document: DocumentRecord) -> Self {
        Self { identity, document }
    }

    pub fn document_id(&self) -> &str {
        &self.document.document_id
    }

    /// A new context carrying an updated document record
    pub fn with_document(&self, document: DocumentRecord) -> Self {
        Self {
            identity: self.identity.clone(),
            document,
        }
    }
}

/// Verifies session tokens and document ownership
pub struct AuthVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    repository: Arc<dyn DocumentRepository>,
}

impl AuthVerifier {
    pub fn new(secret: &[u8], leeway_secs: u64, repository: Arc<dyn DocumentRepository>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            repository,
        }
    }

    /// Check signature and expiry and return the payload
    pub fn decode(&self, token: &str) -> AuthResult<Claims> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(data.claims)
    }

    /// Authenticate a connection to `document_name`.
    ///
    /// Read-only. Runs once per connection before any state exchange.
    pub async fn authenticate(&self, token: &str, document_name: &str) -> AuthResult<CollabContext> {
        let claims = self.decode(token)?;
        let uid = claims
            .subject()
            .ok_or_else(|| AuthError::InvalidToken("missing subject claim".to_string()))?
            .to_string();

        validate_document_name(document_name)?;

        let document = self
            .repository
            .find_document(document_name)
            .await?
            .ok_or_else(|| AuthError::DocumentNotFound(document_name.to_string()))?;

        if document.owner_id != uid {
            debug!(
                "Rejecting {} for {}: owned by {}",
                uid, document_name, document.owner_id
            );
            return Err(AuthError::Unauthorized(document_name.to_string()));
        }

        let identity = self
            .repository
            .find_user(&uid)
            .await?
            .ok_or_else(|| AuthError::IdentityNotFound(uid.clone()))?;

        info!("Document connected: {} by {}", document_name, uid);
        Ok(CollabContext::new(identity, document))
    }
}

/// Reject empty, oversized or unknown-prefix document names
pub fn validate_document_name(name: &str) -> AuthResult<DocumentKind> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_DOCUMENT_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !well_formed {
        return Err(AuthError::InvalidDocumentName(name.to_string()));
    }

    DocumentKind::from_document_id(name)
        .ok_or_else(|| AuthError::InvalidDocumentName(name.to_string()))
}
