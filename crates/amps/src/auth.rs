//! DID authentication: the pluggable authenticator contract and its
//! three shipped variants.
//!
//! [`SignatureAuthenticator`] verifies Ed25519 proofs against keys from a
//! pluggable [`DidResolver`]. [`PlaceholderAuthenticator`] accepts any
//! non-empty DID and tracks tokens in memory — for development.
//! [`NoOpAuthenticator`] is for auth-disabled deployments.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default token validity: 24 hours.
pub const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Accepted skew between a proof timestamp and server time, in seconds.
pub const PROOF_TIMESTAMP_TOLERANCE: i64 = 300;

const NONCE_CACHE_SIZE: usize = 10_000;

/// Canonical authentication error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    /// The DID is empty or malformed.
    InvalidDid,
    /// The proof failed verification (bad signature, stale timestamp,
    /// replayed nonce).
    InvalidProof,
    /// The token existed but is past its expiry.
    ExpiredToken,
    /// The token is unknown (possibly revoked — indistinguishable).
    InvalidToken,
    /// The token was explicitly revoked.
    TokenRevoked,
    /// Authentication failed for another reason.
    AuthFailed,
    /// The DID could not be resolved.
    DidNotFound,
    /// The verification backend is unreachable.
    ServiceUnavailable,
}

impl AuthErrorCode {
    /// The stable wire string for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidDid => "invalid_did",
            Self::InvalidProof => "invalid_proof",
            Self::ExpiredToken => "expired_token",
            Self::InvalidToken => "invalid_token",
            Self::TokenRevoked => "token_revoked",
            Self::AuthFailed => "auth_failed",
            Self::DidNotFound => "did_not_found",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authentication failure with its canonical code.
#[derive(Debug, Clone, Error)]
#[error("auth error [{code}]: {message}")]
pub struct AuthError {
    /// Canonical code, stable across releases.
    pub code: AuthErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl AuthError {
    /// Builds an error from a code and message.
    #[must_use]
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Proof material presented with a verification request.
#[derive(Debug, Clone)]
pub struct AuthProof {
    /// Proof mechanism, e.g. `signature` or `jwt`.
    pub proof_type: String,
    /// The proof bytes (for `signature`: a 64-byte Ed25519 signature).
    pub data: Vec<u8>,
    /// Unix timestamp (seconds) at which the proof was created.
    pub timestamp: i64,
    /// Challenge nonce that was signed, for replay protection.
    pub challenge: Option<String>,
    /// Signature algorithm used.
    pub algorithm: Option<String>,
}

/// Result of a successful [`Authenticator::verify`].
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// The verified DID.
    pub did: String,
    /// Session token for subsequent validation. Empty when the
    /// authenticator does not issue tokens.
    pub token: String,
    /// Token expiry, Unix seconds. Zero when no token was issued.
    pub expires_at: i64,
    /// Additional claims about the identity.
    pub claims: BTreeMap<String, serde_json::Value>,
    /// Verification time, Unix seconds.
    pub verified_at: i64,
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenClaims {
    /// The authenticated DID.
    pub did: String,
    /// Issue time, Unix seconds.
    pub issued_at: i64,
    /// Expiry time, Unix seconds.
    pub expires_at: i64,
    /// Token id, used for revocation.
    pub token_id: String,
    /// Additional claims.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TokenClaims {
    /// Returns `true` if the claims are expired at `now` (Unix seconds).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Contract for DID-based authentication backends.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies an agent's identity proof and, on success, issues a
    /// session token.
    async fn verify(&self, did: &str, proof: &AuthProof)
        -> Result<VerificationResult, AuthError>;

    /// Validates an existing session token.
    async fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError>;

    /// Exchanges a valid token for a fresh one. The old token is dead
    /// afterwards; concurrent refreshes of one token yield one winner.
    async fn refresh_token(&self, token: &str) -> Result<String, AuthError>;

    /// Revokes a token. A revoked token validates as `invalid_token`,
    /// indistinguishable from one that never existed.
    async fn revoke_token(&self, token: &str) -> Result<(), AuthError>;
}

/// Returns the current Unix time in seconds.
///
/// Panics if the system clock is before the Unix epoch — token expiry
/// arithmetic would be meaningless.
#[must_use]
pub fn unix_now_secs() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch");
    i64::try_from(since_epoch.as_secs()).expect("system clock is implausibly far in the future")
}

fn generate_token_id() -> String {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("token_{}", hex::encode(bytes))
}

/// In-memory token table shared by the token-issuing authenticators.
///
/// Refresh performs delete-and-insert under one exclusive section, so
/// two concurrent refreshes of the same token cannot both succeed.
pub struct TokenStore {
    tokens: RwLock<HashMap<String, TokenClaims>>,
    duration_secs: i64,
}

impl TokenStore {
    /// Creates a token table issuing tokens valid for `duration`.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            duration_secs: i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
        }
    }

    /// Issues a token for `did` and returns its claims.
    pub fn issue(&self, did: &str, extra: BTreeMap<String, serde_json::Value>) -> TokenClaims {
        let now = unix_now_secs();
        let claims = TokenClaims {
            did: did.to_owned(),
            issued_at: now,
            expires_at: now + self.duration_secs,
            token_id: generate_token_id(),
            extra,
        };
        self.tokens
            .write()
            .expect("token table poisoned")
            .insert(claims.token_id.clone(), claims.clone());
        claims
    }

    /// Looks up and validates a token.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let now = unix_now_secs();
        {
            let tokens = self.tokens.read().expect("token table poisoned");
            match tokens.get(token) {
                None => {
                    return Err(AuthError::new(AuthErrorCode::InvalidToken, "token not found"))
                }
                Some(claims) if !claims.is_expired_at(now) => return Ok(claims.clone()),
                Some(_) => {}
            }
        }
        // Expired: remove under the exclusive lock, re-checking first.
        let mut tokens = self.tokens.write().expect("token table poisoned");
        if let Some(claims) = tokens.get(token) {
            if claims.is_expired_at(unix_now_secs()) {
                tokens.remove(token);
                return Err(AuthError::new(AuthErrorCode::ExpiredToken, "token has expired"));
            }
            return Ok(claims.clone());
        }
        Err(AuthError::new(AuthErrorCode::InvalidToken, "token not found"))
    }

    /// Atomically replaces a token with a fresh one.
    pub fn refresh(&self, token: &str) -> Result<String, AuthError> {
        let now = unix_now_secs();
        let mut tokens = self.tokens.write().expect("token table poisoned");
        let Some(old) = tokens.remove(token) else {
            return Err(AuthError::new(AuthErrorCode::InvalidToken, "token not found"));
        };
        if old.is_expired_at(now) {
            return Err(AuthError::new(AuthErrorCode::ExpiredToken, "token has expired"));
        }
        let new_claims = TokenClaims {
            did: old.did,
            issued_at: now,
            expires_at: now + self.duration_secs,
            token_id: generate_token_id(),
            extra: old.extra,
        };
        let new_token = new_claims.token_id.clone();
        tokens.insert(new_token.clone(), new_claims);
        Ok(new_token)
    }

    /// Removes a token.
    pub fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let mut tokens = self.tokens.write().expect("token table poisoned");
        if tokens.remove(token).is_none() {
            return Err(AuthError::new(AuthErrorCode::InvalidToken, "token not found"));
        }
        Ok(())
    }
}

fn check_proof_timestamp(timestamp: i64) -> Result<(), AuthError> {
    let now = unix_now_secs();
    if (now - timestamp).abs() > PROOF_TIMESTAMP_TOLERANCE {
        return Err(AuthError::new(
            AuthErrorCode::InvalidProof,
            "proof timestamp out of acceptable range",
        ));
    }
    Ok(())
}

/// Development authenticator: any non-empty DID verifies.
///
/// Tokens are tracked in memory with a configurable validity window.
/// Proof timestamps and nonces are still checked so that clients
/// exercise the same handshake they would against a real backend.
pub struct PlaceholderAuthenticator {
    tokens: TokenStore,
    seen_nonces: Mutex<LruCache<String, ()>>,
}

impl PlaceholderAuthenticator {
    /// Creates a placeholder authenticator with the default 24-hour
    /// token duration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token_duration(DEFAULT_TOKEN_DURATION)
    }

    /// Creates a placeholder authenticator with a custom token duration.
    #[must_use]
    pub fn with_token_duration(duration: Duration) -> Self {
        Self {
            tokens: TokenStore::new(duration),
            seen_nonces: Mutex::new(LruCache::new(
                NonZeroUsize::new(NONCE_CACHE_SIZE).expect("nonzero cache size"),
            )),
        }
    }

    fn check_nonce(&self, nonce: &str) -> Result<(), AuthError> {
        let mut seen = self.seen_nonces.lock().expect("nonce cache poisoned");
        if seen.put(nonce.to_owned(), ()).is_some() {
            return Err(AuthError::new(
                AuthErrorCode::InvalidProof,
                "challenge nonce already used",
            ));
        }
        Ok(())
    }
}

impl Default for PlaceholderAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for PlaceholderAuthenticator {
    async fn verify(&self, did: &str, proof: &AuthProof)
        -> Result<VerificationResult, AuthError> {
        if did.is_empty() {
            return Err(AuthError::new(AuthErrorCode::InvalidDid, "DID cannot be empty"));
        }
        check_proof_timestamp(proof.timestamp)?;
        if let Some(nonce) = &proof.challenge {
            self.check_nonce(nonce)?;
        }

        let mut extra = BTreeMap::new();
        extra.insert("placeholder".to_owned(), serde_json::Value::Bool(true));
        let claims = self.tokens.issue(did, extra);
        Ok(VerificationResult {
            did: did.to_owned(),
            token: claims.token_id,
            expires_at: claims.expires_at,
            claims: claims.extra,
            verified_at: claims.issued_at,
        })
    }

    async fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.tokens.validate(token)
    }

    async fn refresh_token(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.refresh(token)
    }

    async fn revoke_token(&self, token: &str) -> Result<(), AuthError> {
        self.tokens.revoke(token)
    }
}

/// Authenticator for auth-disabled deployments. Every call succeeds.
pub struct NoOpAuthenticator;

impl NoOpAuthenticator {
    /// Creates a no-op authenticator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoOpAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for NoOpAuthenticator {
    async fn verify(&self, did: &str, _proof: &AuthProof)
        -> Result<VerificationResult, AuthError> {
        let now = unix_now_secs();
        let mut claims = BTreeMap::new();
        claims.insert("auth_disabled".to_owned(), serde_json::Value::Bool(true));
        Ok(VerificationResult {
            did: did.to_owned(),
            token: String::new(),
            expires_at: 0,
            claims,
            verified_at: now,
        })
    }

    async fn validate_token(&self, _token: &str) -> Result<TokenClaims, AuthError> {
        let now = unix_now_secs();
        Ok(TokenClaims {
            did: "anonymous".to_owned(),
            issued_at: now,
            expires_at: now + 24 * 60 * 60,
            token_id: String::new(),
            extra: BTreeMap::new(),
        })
    }

    async fn refresh_token(&self, token: &str) -> Result<String, AuthError> {
        Ok(token.to_owned())
    }

    async fn revoke_token(&self, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Resolves a DID to its Ed25519 verifying key.
///
/// Production adapters resolve DID documents over the network; tests use
/// a static map.
#[async_trait]
pub trait DidResolver: Send + Sync {
    /// Resolves `did` to a verifying key, or `did_not_found`.
    async fn resolve(&self, did: &str) -> Result<VerifyingKey, AuthError>;
}

/// Production authenticator: verifies Ed25519 proofs against resolved
/// DID keys, then issues tokens like the placeholder.
pub struct SignatureAuthenticator {
    resolver: std::sync::Arc<dyn DidResolver>,
    tokens: TokenStore,
}

impl SignatureAuthenticator {
    /// Creates a signature authenticator over the given resolver.
    #[must_use]
    pub fn new(resolver: std::sync::Arc<dyn DidResolver>) -> Self {
        Self {
            resolver,
            tokens: TokenStore::new(DEFAULT_TOKEN_DURATION),
        }
    }
}

/// Builds the byte string a client signs to prove control of a DID:
/// `did ‖ nonce ‖ timestamp_be`.
#[must_use]
pub fn proof_message(did: &str, nonce: &str, timestamp: i64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(did.len() + nonce.len() + 8);
    msg.extend_from_slice(did.as_bytes());
    msg.extend_from_slice(nonce.as_bytes());
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg
}

/// Signs a DID ownership proof. Client-side helper, used by tests and
/// external agents.
#[must_use]
pub fn sign_proof(
    signing_key: &ed25519_dalek::SigningKey,
    did: &str,
    nonce: &str,
    timestamp: i64,
) -> [u8; 64] {
    use ed25519_dalek::Signer;
    signing_key
        .sign(&proof_message(did, nonce, timestamp))
        .to_bytes()
}

#[async_trait]
impl Authenticator for SignatureAuthenticator {
    async fn verify(&self, did: &str, proof: &AuthProof)
        -> Result<VerificationResult, AuthError> {
        if did.is_empty() {
            return Err(AuthError::new(AuthErrorCode::InvalidDid, "DID cannot be empty"));
        }
        check_proof_timestamp(proof.timestamp)?;

        let key = self.resolver.resolve(did).await?;
        let sig_bytes: [u8; 64] = proof.data.as_slice().try_into().map_err(|_| {
            AuthError::new(AuthErrorCode::InvalidProof, "signature must be 64 bytes")
        })?;
        let signature = Signature::from_bytes(&sig_bytes);
        let nonce = proof.challenge.as_deref().unwrap_or("");
        key.verify(&proof_message(did, nonce, proof.timestamp), &signature)
            .map_err(|_| {
                AuthError::new(AuthErrorCode::InvalidProof, "signature verification failed")
            })?;

        let claims = self.tokens.issue(did, BTreeMap::new());
        Ok(VerificationResult {
            did: did.to_owned(),
            token: claims.token_id,
            expires_at: claims.expires_at,
            claims: claims.extra,
            verified_at: claims.issued_at,
        })
    }

    async fn validate_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.tokens.validate(token)
    }

    async fn refresh_token(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.refresh(token)
    }

    async fn revoke_token(&self, token: &str) -> Result<(), AuthError> {
        self.tokens.revoke(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn proof() -> AuthProof {
        AuthProof {
            proof_type: "signature".to_owned(),
            data: Vec::new(),
            timestamp: unix_now_secs(),
            challenge: None,
            algorithm: None,
        }
    }

    #[tokio::test]
    async fn placeholder_verify_issues_a_validatable_token() {
        let auth = PlaceholderAuthenticator::new();
        let result = auth.verify("did:web:alice", &proof()).await.unwrap();
        assert!(!result.token.is_empty());
        let claims = auth.validate_token(&result.token).await.unwrap();
        assert_eq!(claims.did, "did:web:alice");
        assert!(!claims.is_expired_at(unix_now_secs()));
    }

    #[tokio::test]
    async fn placeholder_rejects_empty_did() {
        let auth = PlaceholderAuthenticator::new();
        let err = auth.verify("", &proof()).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidDid);
    }

    #[tokio::test]
    async fn placeholder_rejects_stale_timestamp() {
        let auth = PlaceholderAuthenticator::new();
        let mut p = proof();
        p.timestamp = unix_now_secs() - PROOF_TIMESTAMP_TOLERANCE - 1;
        let err = auth.verify("did:web:alice", &p).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidProof);
    }

    #[tokio::test]
    async fn placeholder_rejects_replayed_nonce() {
        let auth = PlaceholderAuthenticator::new();
        let mut p = proof();
        p.challenge = Some("nonce-1".to_owned());
        auth.verify("did:web:alice", &p).await.unwrap();
        let err = auth.verify("did:web:alice", &p).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidProof);
    }

    #[tokio::test]
    async fn validate_unknown_token_is_invalid_token() {
        let auth = PlaceholderAuthenticator::new();
        let err = auth.validate_token("nope").await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);
    }

    #[tokio::test]
    async fn expired_token_is_reported_and_removed() {
        let auth = PlaceholderAuthenticator::with_token_duration(Duration::ZERO);
        let result = auth.verify("did:web:alice", &proof()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let err = auth.validate_token(&result.token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ExpiredToken);
        // Second lookup: the entry is gone entirely.
        let err = auth.validate_token(&result.token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);
    }

    #[tokio::test]
    async fn refresh_invalidates_the_old_token() {
        let auth = PlaceholderAuthenticator::new();
        let result = auth.verify("did:web:alice", &proof()).await.unwrap();
        let new_token = auth.refresh_token(&result.token).await.unwrap();
        assert_ne!(new_token, result.token);
        let err = auth.validate_token(&result.token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);
        let claims = auth.validate_token(&new_token).await.unwrap();
        assert_eq!(claims.did, "did:web:alice");
    }

    #[tokio::test]
    async fn revoke_then_revoke_again() {
        let auth = PlaceholderAuthenticator::new();
        let result = auth.verify("did:web:alice", &proof()).await.unwrap();
        auth.revoke_token(&result.token).await.unwrap();
        let err = auth.revoke_token(&result.token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);
        let err = auth.validate_token(&result.token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);
    }

    #[test]
    fn concurrent_refresh_has_exactly_one_winner() {
        let store = Arc::new(TokenStore::new(DEFAULT_TOKEN_DURATION));
        let claims = store.issue("did:web:alice", BTreeMap::new());
        let token = claims.token_id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(std::thread::spawn(move || store.refresh(&token).is_ok()));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|b| *b)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn noop_accepts_everything() {
        let auth = NoOpAuthenticator::new();
        auth.verify("did:web:anyone", &proof()).await.unwrap();
        let claims = auth.validate_token("whatever").await.unwrap();
        assert_eq!(claims.did, "anonymous");
        assert!(!claims.is_expired_at(unix_now_secs()));
        assert_eq!(auth.refresh_token("t").await.unwrap(), "t");
        auth.revoke_token("t").await.unwrap();
    }

    struct StaticResolver {
        did: String,
        key: VerifyingKey,
    }

    #[async_trait]
    impl DidResolver for StaticResolver {
        async fn resolve(&self, did: &str) -> Result<VerifyingKey, AuthError> {
            if did == self.did {
                Ok(self.key)
            } else {
                Err(AuthError::new(AuthErrorCode::DidNotFound, "unknown DID"))
            }
        }
    }

    #[tokio::test]
    async fn signature_authenticator_accepts_a_valid_proof() {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let auth = SignatureAuthenticator::new(Arc::new(StaticResolver {
            did: "did:web:alice".to_owned(),
            key: signing_key.verifying_key(),
        }));

        let ts = unix_now_secs();
        let sig = sign_proof(&signing_key, "did:web:alice", "n-1", ts);
        let p = AuthProof {
            proof_type: "signature".to_owned(),
            data: sig.to_vec(),
            timestamp: ts,
            challenge: Some("n-1".to_owned()),
            algorithm: Some("ed25519".to_owned()),
        };
        let result = auth.verify("did:web:alice", &p).await.unwrap();
        assert_eq!(result.did, "did:web:alice");
        auth.validate_token(&result.token).await.unwrap();
    }

    #[tokio::test]
    async fn signature_authenticator_rejects_a_forged_proof() {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let other_key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let auth = SignatureAuthenticator::new(Arc::new(StaticResolver {
            did: "did:web:alice".to_owned(),
            key: signing_key.verifying_key(),
        }));

        let ts = unix_now_secs();
        let sig = sign_proof(&other_key, "did:web:alice", "n-1", ts);
        let p = AuthProof {
            proof_type: "signature".to_owned(),
            data: sig.to_vec(),
            timestamp: ts,
            challenge: Some("n-1".to_owned()),
            algorithm: Some("ed25519".to_owned()),
        };
        let err = auth.verify("did:web:alice", &p).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidProof);
    }

    #[tokio::test]
    async fn signature_authenticator_reports_unknown_did() {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let auth = SignatureAuthenticator::new(Arc::new(StaticResolver {
            did: "did:web:alice".to_owned(),
            key: signing_key.verifying_key(),
        }));
        let err = auth.verify("did:web:mallory", &proof()).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::DidNotFound);
    }
}
