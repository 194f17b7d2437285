//! Peer authorization for TLS-secured channels.
//!
//! After a handshake completes, the peer's leaf certificate subject is turned
//! into an identity by a [`PrincipalMapper`] and checked against the allow
//! list of an [`AuthzPolicy`].
//!
//! # Rule syntax
//!
//! Rules are comma-separated and tried in order until one matches:
//!
//! - `DEFAULT` returns the subject DN unchanged
//! - `RULE:pattern/replacement/[LU]` applies a regex replacement, then
//!   optionally lowercases (`L`) or uppercases (`U`) the result
//!
//! ```
//! use chardev_core::tls::authz::PrincipalMapper;
//!
//! let mapper = PrincipalMapper::from_rules("RULE:^CN=([^,]+),.*$/$1/L,DEFAULT").unwrap();
//! assert_eq!(mapper.map("CN=QEMU-Client,O=Example").unwrap(), "qemu-client");
//! ```

use std::fmt;

use regex::Regex;
use rustls::pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::config::AuthzConfig;
use crate::error::{ConfigError, ConfigResult};

/// Errors raised while authorizing a peer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthzError {
    /// The peer did not present a certificate.
    #[error("peer presented no certificate")]
    NoPeerCertificate,

    /// The peer certificate could not be parsed.
    #[error("failed to parse peer certificate: {0}")]
    CertificateParse(String),

    /// The subject did not map to an identity.
    #[error(transparent)]
    Mapping(#[from] MapperError),

    /// The identity is not on the allow list.
    #[error("peer '{identity}' is not authorized by policy '{policy}'")]
    Denied { identity: String, policy: String },
}

/// Errors from parsing or applying mapping rules.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MapperError {
    #[error("invalid mapping rule: {0}")]
    InvalidRule(String),

    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),

    #[error("no mapping rule matched DN: {0}")]
    NoMatchingRule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseTransform {
    Lower,
    Upper,
}

#[derive(Debug, Clone)]
enum Rule {
    Default,
    Replace {
        pattern: Regex,
        replacement: String,
        case: Option<CaseTransform>,
    },
}

impl Rule {
    fn parse(text: &str) -> Result<Self, MapperError> {
        if text.eq_ignore_ascii_case("DEFAULT") {
            return Ok(Self::Default);
        }
        let body = text.strip_prefix("RULE:").ok_or_else(|| {
            MapperError::InvalidRule(format!("expected 'RULE:' or 'DEFAULT': {text}"))
        })?;

        let mut parts = body.splitn(3, '/');
        let pattern = parts.next().unwrap_or_default();
        let replacement = parts
            .next()
            .ok_or_else(|| MapperError::InvalidRule(format!("missing replacement: {text}")))?;
        let case = match parts.next().unwrap_or_default() {
            "" => None,
            "L" | "l" => Some(CaseTransform::Lower),
            "U" | "u" => Some(CaseTransform::Upper),
            other => {
                return Err(MapperError::InvalidRule(format!(
                    "invalid case flag '{other}', expected L or U"
                )))
            }
        };
        let pattern = Regex::new(pattern)
            .map_err(|e| MapperError::InvalidPattern(format!("{pattern}: {e}")))?;

        Ok(Self::Replace {
            pattern,
            replacement: replacement.to_string(),
            case,
        })
    }

    fn apply(&self, dn: &str) -> Option<String> {
        match self {
            Self::Default => Some(dn.to_string()),
            Self::Replace {
                pattern,
                replacement,
                case,
            } => {
                let caps = pattern.captures(dn)?;
                let mut out = String::new();
                caps.expand(replacement, &mut out);
                Some(match case {
                    Some(CaseTransform::Lower) => out.to_lowercase(),
                    Some(CaseTransform::Upper) => out.to_uppercase(),
                    None => out,
                })
            }
        }
    }
}

/// Maps certificate subject DNs to identities.
#[derive(Debug, Clone)]
pub struct PrincipalMapper {
    rules: Vec<Rule>,
}

impl Default for PrincipalMapper {
    fn default() -> Self {
        Self {
            rules: vec![Rule::Default],
        }
    }
}

impl PrincipalMapper {
    /// Parse a comma-separated rule list. An empty list means `DEFAULT`.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule is malformed or its regex does not compile.
    pub fn from_rules(rules: &str) -> Result<Self, MapperError> {
        let rules = split_rules(rules)
            .into_iter()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(Rule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if rules.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self { rules })
    }

    /// Map a subject DN using the first rule that matches.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingRule` when nothing matches.
    pub fn map(&self, dn: &str) -> Result<String, MapperError> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(dn))
            .ok_or_else(|| MapperError::NoMatchingRule(dn.to_string()))
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl fmt::Display for PrincipalMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrincipalMapper({} rules)", self.rules.len())
    }
}

/// Split on the commas that start a new `RULE:` or `DEFAULT`, leaving commas
/// inside patterns alone.
fn split_rules(rules: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, _) in rules.match_indices(',') {
        let next = rules[idx + 1..].trim_start().to_ascii_uppercase();
        if next.starts_with("RULE:") || next.starts_with("DEFAULT") {
            out.push(&rules[start..idx]);
            start = idx + 1;
        }
    }
    out.push(&rules[start..]);
    out
}

/// A named allow list of peer identities.
#[derive(Debug, Clone)]
pub struct AuthzPolicy {
    id: String,
    allow: Vec<String>,
    mapper: PrincipalMapper,
}

impl AuthzPolicy {
    /// Build a policy from a list of allowed identities.
    #[must_use]
    pub fn new(id: impl Into<String>, allow: Vec<String>, mapper: PrincipalMapper) -> Self {
        Self {
            id: id.into(),
            allow,
            mapper,
        }
    }

    /// Build a policy from its YAML form.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping rules are invalid.
    pub fn from_config(id: &str, config: &AuthzConfig) -> ConfigResult<Self> {
        let mapper = match &config.rules {
            Some(rules) => PrincipalMapper::from_rules(rules)
                .map_err(|e| ConfigError::InvalidRules(e.to_string()))?,
            None => PrincipalMapper::default(),
        };
        Ok(Self::new(id, config.allow.clone(), mapper))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authorize the peer whose certificate chain is `peer_certs`, returning
    /// its mapped identity.
    ///
    /// # Errors
    ///
    /// Fails if no certificate was presented, the leaf cannot be parsed, the
    /// subject maps to nothing, or the identity is not allowed.
    pub fn check(&self, peer_certs: Option<&[CertificateDer<'_>]>) -> Result<String, AuthzError> {
        let leaf = peer_certs
            .and_then(<[_]>::first)
            .ok_or(AuthzError::NoPeerCertificate)?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| AuthzError::CertificateParse(e.to_string()))?;
        let subject = cert.subject().to_string();
        self.check_subject(&subject)
    }

    /// Authorize a subject DN directly.
    ///
    /// # Errors
    ///
    /// Fails if the subject maps to nothing or the identity is not allowed.
    pub fn check_subject(&self, subject: &str) -> Result<String, AuthzError> {
        let identity = self.mapper.map(subject)?;
        if self.allow.iter().any(|allowed| allowed == &identity) {
            debug!(policy = %self.id, identity = %identity, "peer authorized");
            Ok(identity)
        } else {
            warn!(policy = %self.id, identity = %identity, "peer rejected by policy");
            Err(AuthzError::Denied {
                identity,
                policy: self.id.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_returns_dn() {
        let mapper = PrincipalMapper::from_rules("DEFAULT").unwrap();
        let dn = "CN=client1,O=Example";
        assert_eq!(mapper.map(dn).unwrap(), dn);
        assert_eq!(PrincipalMapper::default().map(dn).unwrap(), dn);
    }

    #[test]
    fn test_extract_cn_with_case() {
        let lower = PrincipalMapper::from_rules("RULE:^CN=([^,]+),.*$/$1/L").unwrap();
        let upper = PrincipalMapper::from_rules("RULE:^CN=([^,]+),.*$/$1/u").unwrap();
        let keep = PrincipalMapper::from_rules("RULE:^CN=([^,]+),.*$/$1").unwrap();
        let dn = "CN=Qemu-Client,OU=Virt,O=Example";
        assert_eq!(lower.map(dn).unwrap(), "qemu-client");
        assert_eq!(upper.map(dn).unwrap(), "QEMU-CLIENT");
        assert_eq!(keep.map(dn).unwrap(), "Qemu-Client");
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mapper = PrincipalMapper::from_rules(
            "RULE:^CN=admin-([^,]+).*$/admin:$1/U, RULE:^CN=([^,]+).*$/$1/L, DEFAULT",
        )
        .unwrap();
        assert_eq!(mapper.rule_count(), 3);
        assert_eq!(mapper.map("CN=admin-Root,OU=Ops").unwrap(), "ADMIN:ROOT");
        assert_eq!(mapper.map("CN=Guest,OU=Ops").unwrap(), "guest");
        assert_eq!(mapper.map("OU=Nameless").unwrap(), "OU=Nameless");
    }

    #[test]
    fn test_comma_inside_pattern_is_not_a_separator() {
        let mapper = PrincipalMapper::from_rules("RULE:^CN=([^,]+),OU=([^,]+).*$/$2:$1/").unwrap();
        assert_eq!(mapper.rule_count(), 1);
        assert_eq!(mapper.map("CN=alice,OU=Virt,O=X").unwrap(), "Virt:alice");
    }

    #[test]
    fn test_no_match_is_error() {
        let mapper = PrincipalMapper::from_rules("RULE:^OU=([^,]+).*$/$1/").unwrap();
        assert!(matches!(
            mapper.map("CN=x"),
            Err(MapperError::NoMatchingRule(_))
        ));
    }

    #[test]
    fn test_invalid_rules() {
        assert!(matches!(
            PrincipalMapper::from_rules("INVALID:x"),
            Err(MapperError::InvalidRule(_))
        ));
        assert!(matches!(
            PrincipalMapper::from_rules("RULE:[bad/x/"),
            Err(MapperError::InvalidPattern(_))
        ));
        assert!(matches!(
            PrincipalMapper::from_rules("RULE:^CN=(.*)$/$1/X"),
            Err(MapperError::InvalidRule(_))
        ));
        assert_eq!(PrincipalMapper::from_rules("").unwrap().rule_count(), 1);
    }

    #[test]
    fn test_policy_allows_and_denies() {
        let mapper = PrincipalMapper::from_rules("RULE:^CN=([^,]+).*$/$1/L").unwrap();
        let policy = AuthzPolicy::new("auth0", vec!["qemu-client".to_string()], mapper);

        assert_eq!(
            policy.check_subject("CN=QEMU-Client,O=Example").unwrap(),
            "qemu-client"
        );
        let err = policy.check_subject("CN=intruder,O=Example").unwrap_err();
        assert!(matches!(err, AuthzError::Denied { ref identity, .. } if identity == "intruder"));
    }

    #[test]
    fn test_policy_requires_certificate() {
        let policy = AuthzPolicy::new("auth0", vec![], PrincipalMapper::default());
        assert!(matches!(policy.check(None), Err(AuthzError::NoPeerCertificate)));
        let empty: &[CertificateDer<'_>] = &[];
        assert!(matches!(
            policy.check(Some(empty)),
            Err(AuthzError::NoPeerCertificate)
        ));
    }

    #[test]
    fn test_policy_rejects_garbage_certificate() {
        let policy = AuthzPolicy::new("auth0", vec![], PrincipalMapper::default());
        let junk = vec![CertificateDer::from(vec![0u8, 1, 2, 3])];
        assert!(matches!(
            policy.check(Some(junk.as_slice())),
            Err(AuthzError::CertificateParse(_))
        ));
    }

    #[test]
    fn test_policy_from_config() {
        let config = AuthzConfig {
            allow: vec!["CN=exact".to_string()],
            rules: None,
        };
        let policy = AuthzPolicy::from_config("p", &config).unwrap();
        assert_eq!(policy.id(), "p");
        assert!(policy.check_subject("CN=exact").is_ok());

        let bad = AuthzConfig {
            allow: vec![],
            rules: Some("bogus".to_string()),
        };
        assert!(AuthzPolicy::from_config("p", &bad).is_err());
    }
}
