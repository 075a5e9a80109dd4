//! External collaborators: identity resolution and region detection.
//!
//! Both are owned by subsystems outside the relay and are consumed as
//! pure functions behind traits so deployments can plug in their own.

use std::collections::HashMap;
use std::net::IpAddr;

use sha2::{Digest, Sha256};

use pairwave_protocol::{Identity, Region};

/// An authenticated user as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: Identity,
    pub display_name: String,
}

/// Errors from identity resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid token")]
    InvalidToken,
}

/// Errors from region lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no region known for {0}")]
pub struct LookupError(pub IpAddr);

/// Maps the CONNECT credentials to a stable identity.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        authorization: Option<&str>,
        login: Option<&str>,
    ) -> Result<Principal, AuthError>;
}

/// Maps a client address to its home region.
pub trait RegionLookup: Send + Sync + 'static {
    fn region_for(&self, addr: IpAddr) -> Result<Region, LookupError>;
}

/// Display name used when nothing better is known.
const ANONYMOUS_NAME: &str = "Stranger";

/// Resolves bearer tokens to identities.
///
/// The identity is a digest of the token, so the same session token always
/// maps to the same identity without exposing the token itself. With an
/// empty allow-list every non-empty token is accepted.
#[derive(Debug, Clone, Default)]
pub struct TokenIdentityResolver {
    /// token -> display name
    allowed: HashMap<String, String>,
}

impl TokenIdentityResolver {
    /// Accepts any non-empty token.
    pub fn open() -> Self {
        Self::default()
    }

    /// Accepts only the listed tokens.
    pub fn with_tokens(allowed: HashMap<String, String>) -> Self {
        Self { allowed }
    }

    fn identity_for(token: &str) -> Identity {
        let digest = Sha256::digest(token.as_bytes());
        Identity::new(format!("u-{}", hex::encode(&digest[..12])))
    }
}

impl IdentityResolver for TokenIdentityResolver {
    fn resolve(
        &self,
        authorization: Option<&str>,
        login: Option<&str>,
    ) -> Result<Principal, AuthError> {
        let raw = authorization.map(str::trim).unwrap_or_default();
        let token = match raw.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => raw,
        };
        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let display_name = if self.allowed.is_empty() {
            login
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .unwrap_or(ANONYMOUS_NAME)
                .to_string()
        } else {
            self.allowed
                .get(token)
                .cloned()
                .ok_or(AuthError::InvalidToken)?
        };

        Ok(Principal {
            identity: Self::identity_for(token),
            display_name,
        })
    }
}

/// Region table keyed by exact address, with an optional fallback.
#[derive(Debug, Clone, Default)]
pub struct StaticRegionLookup {
    default: Option<Region>,
    overrides: HashMap<IpAddr, Region>,
}

impl StaticRegionLookup {
    pub fn new(default: Option<Region>, overrides: HashMap<IpAddr, Region>) -> Self {
        Self { default, overrides }
    }
}

impl RegionLookup for StaticRegionLookup {
    fn region_for(&self, addr: IpAddr) -> Result<Region, LookupError> {
        self.overrides
            .get(&addr)
            .or(self.default.as_ref())
            .cloned()
            .ok_or(LookupError(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_optional() {
        let resolver = TokenIdentityResolver::open();
        let a = resolver.resolve(Some("Bearer abc"), None).unwrap();
        let b = resolver.resolve(Some("abc"), None).unwrap();
        assert_eq!(a.identity, b.identity);
        assert!(a.identity.as_str().starts_with("u-"));
        assert_eq!(a.identity.as_str().len(), 2 + 24);
    }

    #[test]
    fn different_tokens_get_different_identities() {
        let resolver = TokenIdentityResolver::open();
        let a = resolver.resolve(Some("Bearer one"), None).unwrap();
        let b = resolver.resolve(Some("Bearer two"), None).unwrap();
        assert_ne!(a.identity, b.identity);
    }

    #[test]
    fn missing_token_is_rejected() {
        let resolver = TokenIdentityResolver::open();
        assert_eq!(
            resolver.resolve(None, Some("alice")),
            Err(AuthError::MissingCredentials)
        );
        assert_eq!(
            resolver.resolve(Some("Bearer   "), None),
            Err(AuthError::MissingCredentials)
        );
    }

    #[test]
    fn open_mode_uses_login_as_display_name() {
        let resolver = TokenIdentityResolver::open();
        let p = resolver.resolve(Some("t"), Some("alice")).unwrap();
        assert_eq!(p.display_name, "alice");
        let p = resolver.resolve(Some("t"), None).unwrap();
        assert_eq!(p.display_name, ANONYMOUS_NAME);
    }

    #[test]
    fn allow_list_restricts_tokens() {
        let resolver = TokenIdentityResolver::with_tokens(HashMap::from([(
            "secret".to_string(),
            "Alice".to_string(),
        )]));
        let p = resolver.resolve(Some("Bearer secret"), Some("ignored")).unwrap();
        assert_eq!(p.display_name, "Alice");
        assert_eq!(
            resolver.resolve(Some("Bearer other"), None),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn static_region_lookup_prefers_override() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        let lookup = StaticRegionLookup::new(
            Some(Region::new("US")),
            HashMap::from([(addr, Region::new("FR"))]),
        );
        assert_eq!(lookup.region_for(addr).unwrap(), Region::new("FR"));
        assert_eq!(lookup.region_for(other).unwrap(), Region::new("US"));

        let empty = StaticRegionLookup::default();
        assert_eq!(empty.region_for(addr), Err(LookupError(addr)));
    }
}
