//! XMPP addresses (RFC 7622).
//!
//! A [`Jid`] is a `node@domain/resource` triple. Parts are prepared on
//! construction unless the caller explicitly skips preparation (used for
//! addresses that were already prepared, such as those decoded from the
//! cluster wire format).

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length in bytes of each JID part.
pub const MAX_PART_LEN: usize = 1023;

/// Characters never allowed in a node part.
const NODE_PROHIBITED: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// JID construction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JidError {
    #[error("domain part is empty")]
    EmptyDomain,

    #[error("empty node part before '@'")]
    EmptyNode,

    #[error("empty resource part after '/'")]
    EmptyResource,

    #[error("{part} part exceeds {MAX_PART_LEN} bytes")]
    TooLong { part: &'static str },

    #[error("node contains prohibited character {0:?}")]
    ProhibitedNodeChar(char),

    #[error("invalid IPv6 literal: {0}")]
    InvalidIpv6(String),

    #[error("domain preparation failed: {0}")]
    DomainPrep(String),

    #[error("{part} preparation failed: {reason}")]
    Prep { part: &'static str, reason: String },
}

/// A prepared XMPP address.
///
/// Equality, ordering and hashing operate on the prepared parts. Empty
/// `node`/`resource` strings mean the part is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Build a JID from its parts.
    ///
    /// With `skip_prep = false` the node goes through username case mapping,
    /// the domain through IDNA ToUnicode and the resource through the opaque
    /// string profile.
    pub fn new(node: &str, domain: &str, resource: &str, skip_prep: bool) -> Result<Self, JidError> {
        let (node, domain, resource) = if skip_prep {
            (node.to_string(), domain.to_string(), resource.to_string())
        } else {
            let domain = prep_domain(domain)?;
            let (node, resource) = prep_local_parts(node, resource)?;
            (node, domain, resource)
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        check_len("node", &node)?;
        check_len("domain", &domain)?;
        check_len("resource", &resource)?;

        Ok(Self {
            node,
            domain,
            resource,
        })
    }

    /// Parse and prepare a JID from its string form.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        Self::parse_with(s, false)
    }

    /// Parse a JID, optionally skipping preparation.
    pub fn parse_with(s: &str, skip_prep: bool) -> Result<Self, JidError> {
        let (bare, resource) = match s.find('/') {
            Some(idx) => {
                let resource = &s[idx + 1..];
                if resource.is_empty() {
                    return Err(JidError::EmptyResource);
                }
                (&s[..idx], resource)
            }
            None => (s, ""),
        };
        let (node, domain) = match bare.find('@') {
            Some(idx) => {
                let node = &bare[..idx];
                if node.is_empty() {
                    return Err(JidError::EmptyNode);
                }
                (node, &bare[idx + 1..])
            }
            None => ("", bare),
        };
        Self::new(node, domain, resource, skip_prep)
    }

    /// A domain-only JID.
    pub fn domain_jid(domain: &str) -> Result<Self, JidError> {
        Self::new("", domain, "", false)
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// True when the JID carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource.is_empty()
    }

    /// True when the JID carries a resource.
    pub fn is_full(&self) -> bool {
        !self.resource.is_empty()
    }

    /// True for a domain-only address.
    pub fn is_server(&self) -> bool {
        self.node.is_empty() && self.resource.is_empty()
    }

    /// True for a full address with a node.
    pub fn is_full_with_user(&self) -> bool {
        !self.node.is_empty() && !self.resource.is_empty()
    }

    /// The same address without its resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    /// The bare address of this JID's domain.
    pub fn to_domain(&self) -> Jid {
        Jid {
            node: String::new(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    /// The same bare address bound to another resource.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        Jid::new(&self.node, &self.domain, resource, false)
    }

    /// Compare node and domain only.
    pub fn matches_bare(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.node.is_empty() {
            write!(f, "{}@", self.node)?;
        }
        f.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Jid::parse(s)
    }
}

fn check_len(part: &'static str, value: &str) -> Result<(), JidError> {
    if value.len() > MAX_PART_LEN {
        return Err(JidError::TooLong { part });
    }
    Ok(())
}

fn prep_domain(domain: &str) -> Result<String, JidError> {
    if domain.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    if domain.len() > MAX_PART_LEN {
        return Err(JidError::TooLong { part: "domain" });
    }
    if let Some(inner) = domain.strip_prefix('[') {
        let literal = inner
            .strip_suffix(']')
            .ok_or_else(|| JidError::InvalidIpv6(domain.to_string()))?;
        literal
            .parse::<Ipv6Addr>()
            .map_err(|_| JidError::InvalidIpv6(domain.to_string()))?;
        return Ok(domain.to_ascii_lowercase());
    }
    let trimmed = domain.strip_suffix('.').unwrap_or(domain);
    let (prepared, result) = idna::domain_to_unicode(trimmed);
    result.map_err(|e| JidError::DomainPrep(e.to_string()))?;
    Ok(prepared.to_lowercase())
}

/// Node and resource share one pass through the `jid` crate's PRECIS
/// profiles, anchored on a placeholder domain.
fn prep_local_parts(node: &str, resource: &str) -> Result<(String, String), JidError> {
    if node.is_empty() && resource.is_empty() {
        return Ok((String::new(), String::new()));
    }
    if let Some(c) = node.chars().find(|c| NODE_PROHIBITED.contains(c)) {
        return Err(JidError::ProhibitedNodeChar(c));
    }
    check_len("node", node)?;
    check_len("resource", resource)?;

    let mut probe = String::with_capacity(node.len() + resource.len() + 12);
    if !node.is_empty() {
        probe.push_str(node);
        probe.push('@');
    }
    probe.push_str("localhost");
    if !resource.is_empty() {
        probe.push('/');
        probe.push_str(resource);
    }

    let prepared: ::jid::Jid = probe.parse().map_err(|e: ::jid::Error| JidError::Prep {
        part: if node.is_empty() { "resource" } else { "node" },
        reason: e.to_string(),
    })?;
    let node = prepared.node().map(|n| n.to_string()).unwrap_or_default();
    let resource = prepared
        .resource()
        .map(|r| r.to_string())
        .unwrap_or_default();
    Ok((node, resource))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let jid = Jid::parse("ortuman@jackal.im/balcony").unwrap();
        assert_eq!(jid.node(), "ortuman");
        assert_eq!(jid.domain(), "jackal.im");
        assert_eq!(jid.resource(), "balcony");
        assert!(jid.is_full());
        assert!(jid.is_full_with_user());
    }

    #[test]
    fn test_parse_domain_only() {
        let jid = Jid::parse("jackal.im").unwrap();
        assert!(jid.is_server());
        assert!(jid.is_bare());
        assert_eq!(jid.to_string(), "jackal.im");
    }

    #[test]
    fn test_round_trip() {
        for (n, d, r) in [
            ("ortuman", "jackal.im", "balcony"),
            ("", "jackal.im", ""),
            ("hamlet", "example.org", ""),
            ("", "example.org", "res"),
        ] {
            let jid = Jid::new(n, d, r, false).unwrap();
            assert_eq!(jid.to_string().parse::<Jid>().unwrap(), jid);
        }
    }

    #[test]
    fn test_node_prohibited_chars() {
        for c in ['"', '&', '\'', '/', ':', '<', '>', '@'] {
            let node = format!("ab{c}cd");
            assert_eq!(
                Jid::new(&node, "jackal.im", "", false),
                Err(JidError::ProhibitedNodeChar(c))
            );
        }
    }

    #[test]
    fn test_node_is_case_mapped() {
        let jid = Jid::new("OrTuMan", "Jackal.IM", "Balcony", false).unwrap();
        assert_eq!(jid.node(), "ortuman");
        assert_eq!(jid.domain(), "jackal.im");
        assert_eq!(jid.resource(), "Balcony");
    }

    #[test]
    fn test_domain_length() {
        assert_eq!(Jid::new("a", "", "", false), Err(JidError::EmptyDomain));
        let long = "a".repeat(1024);
        assert!(Jid::new("", &long, "", false).is_err());
        assert!(Jid::new("", &long, "", true).is_err());
    }

    #[test]
    fn test_ipv6_literal() {
        assert!(Jid::new("", "[::1]", "", false).is_ok());
        assert!(Jid::new("", "[not-an-ip]", "", false).is_err());
        assert!(Jid::new("", "[::1", "", false).is_err());
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert_eq!(Jid::parse("@jackal.im"), Err(JidError::EmptyNode));
        assert_eq!(Jid::parse("jackal.im/"), Err(JidError::EmptyResource));
    }

    #[test]
    fn test_bare_and_domain() {
        let jid = Jid::parse("ortuman@jackal.im/garden").unwrap();
        assert_eq!(jid.to_bare().to_string(), "ortuman@jackal.im");
        assert_eq!(jid.to_domain().to_string(), "jackal.im");
        assert!(jid.matches_bare(&jid.to_bare()));
    }
}
