//! Authorization gate for registry mutations and hub subscriptions.
//!
//! The gate is stateless: it asks a [`CredentialValidator`] which scopes a
//! bearer token carries and compares them with the scope an operation
//! needs. Token storage belongs to whoever configures the validator; the
//! built-in [`StaticTokenValidator`] only holds SHA-256 digests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::session::SessionError;

/// Length in bytes of generated tokens.
const TOKEN_BYTES: usize = 32;

/// What a credential is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Subscribe to session output.
    View,
    /// Create, write to, resize, rename, kill and prune sessions. Implies `View`.
    Control,
}

impl Scope {
    /// Whether holding `self` satisfies `required`.
    pub fn grants(self, required: Scope) -> bool {
        self >= required
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::View => write!(f, "view"),
            Scope::Control => write!(f, "control"),
        }
    }
}

/// A caller's credential.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Bearer token presented by a remote viewer.
    Bearer(String),
    /// The peer on the local control socket.
    LocalPeer,
    /// No credential.
    Anonymous,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Credential::LocalPeer => write!(f, "LocalPeer"),
            Credential::Anonymous => write!(f, "Anonymous"),
        }
    }
}

/// Authorization failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential required for {0} access")]
    MissingCredential(Scope),

    #[error("credential rejected")]
    InvalidCredential,

    #[error("credential lacks {0} scope")]
    InsufficientScope(Scope),
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        SessionError::Unauthorized(err.to_string())
    }
}

/// Resolves a bearer token to the scopes it carries.
pub trait CredentialValidator: Send + Sync {
    /// `None` if the token is not recognised.
    fn scopes_for(&self, token: &str) -> Option<Vec<Scope>>;
}

/// Validator over a fixed set of SHA-256 token digests.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenValidator {
    digests: HashMap<String, Vec<Scope>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token_sha256` (lowercase hex) with `scopes`.
    pub fn with_digest(mut self, token_sha256: impl Into<String>, scopes: Vec<Scope>) -> Self {
        self.digests
            .insert(token_sha256.into().to_lowercase(), scopes);
        self
    }

    /// Number of accepted tokens.
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl CredentialValidator for StaticTokenValidator {
    fn scopes_for(&self, token: &str) -> Option<Vec<Scope>> {
        self.digests.get(&hash_token(token)).cloned()
    }
}

/// SHA-256 of a token as lowercase hex.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a random bearer token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The gate consulted before every mutating registry call and every subscribe.
#[derive(Clone)]
pub struct AuthGate {
    enabled: bool,
    trust_local_peer: bool,
    validator: Arc<dyn CredentialValidator>,
}

impl AuthGate {
    pub fn new(validator: Arc<dyn CredentialValidator>, trust_local_peer: bool) -> Self {
        Self {
            enabled: true,
            trust_local_peer,
            validator,
        }
    }

    /// A gate that allows everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            trust_local_peer: true,
            validator: Arc::new(StaticTokenValidator::new()),
        }
    }

    /// Build the gate described by the `[auth]` config section.
    pub fn from_config(config: &AuthConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let validator = config
            .tokens
            .iter()
            .fold(StaticTokenValidator::new(), |v, t| {
                v.with_digest(t.sha256.clone(), t.scopes.clone())
            });
        tracing::info!(tokens = validator.len(), "Auth gate enabled");
        Self::new(Arc::new(validator), config.trust_local_peer)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check `credential` against `required`.
    pub fn authorize(&self, credential: &Credential, required: Scope) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }

        let result = match credential {
            Credential::LocalPeer if self.trust_local_peer => Ok(()),
            Credential::LocalPeer | Credential::Anonymous => {
                Err(AuthError::MissingCredential(required))
            }
            Credential::Bearer(token) => match self.validator.scopes_for(token) {
                None => Err(AuthError::InvalidCredential),
                Some(scopes) if scopes.iter().any(|s| s.grants(required)) => Ok(()),
                Some(_) => Err(AuthError::InsufficientScope(required)),
            },
        };

        if let Err(ref e) = result {
            tracing::warn!(credential = ?credential, required = %required, error = %e, "Authorization denied");
        }
        result
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.enabled)
            .field("trust_local_peer", &self.trust_local_peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;

    fn gate_with(token: &str, scopes: Vec<Scope>) -> AuthGate {
        let validator = StaticTokenValidator::new().with_digest(hash_token(token), scopes);
        AuthGate::new(Arc::new(validator), true)
    }

    #[test]
    fn test_control_implies_view() {
        assert!(Scope::Control.grants(Scope::View));
        assert!(Scope::Control.grants(Scope::Control));
        assert!(Scope::View.grants(Scope::View));
        assert!(!Scope::View.grants(Scope::Control));
    }

    #[test]
    fn test_disabled_gate_allows_anonymous() {
        let gate = AuthGate::disabled();
        assert!(gate.authorize(&Credential::Anonymous, Scope::Control).is_ok());
    }

    #[test]
    fn test_bearer_scopes() {
        let gate = gate_with("viewer-token", vec![Scope::View]);

        let cred = Credential::Bearer("viewer-token".to_string());
        assert!(gate.authorize(&cred, Scope::View).is_ok());
        assert_eq!(
            gate.authorize(&cred, Scope::Control),
            Err(AuthError::InsufficientScope(Scope::Control))
        );
    }

    #[test]
    fn test_unknown_token_rejected() {
        let gate = gate_with("good", vec![Scope::Control]);
        assert_eq!(
            gate.authorize(&Credential::Bearer("bad".to_string()), Scope::View),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn test_anonymous_rejected_when_enabled() {
        let gate = gate_with("t", vec![Scope::Control]);
        assert_eq!(
            gate.authorize(&Credential::Anonymous, Scope::View),
            Err(AuthError::MissingCredential(Scope::View))
        );
    }

    #[test]
    fn test_local_peer_trust() {
        let trusted = gate_with("t", vec![]);
        assert!(trusted.authorize(&Credential::LocalPeer, Scope::Control).is_ok());

        let untrusted = AuthGate::new(Arc::new(StaticTokenValidator::new()), false);
        assert!(untrusted
            .authorize(&Credential::LocalPeer, Scope::View)
            .is_err());
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_generate_token_is_random_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }

    #[test]
    fn test_from_config() {
        let config = AuthConfig {
            enabled: true,
            trust_local_peer: false,
            tokens: vec![TokenEntry {
                sha256: hash_token("secret").to_uppercase(),
                scopes: vec![Scope::Control],
            }],
        };
        let gate = AuthGate::from_config(&config);

        assert!(gate.is_enabled());
        assert!(gate
            .authorize(&Credential::Bearer("secret".to_string()), Scope::Control)
            .is_ok());
        assert!(gate.authorize(&Credential::LocalPeer, Scope::View).is_err());
    }

    #[test]
    fn test_unauthorized_maps_to_session_error() {
        let err: SessionError = AuthError::InvalidCredential.into();
        assert_eq!(err.code(), "Unauthorized");
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let dbg = format!("{:?}", Credential::Bearer("s3cret".to_string()));
        assert!(!dbg.contains("s3cret"));
    }
}
