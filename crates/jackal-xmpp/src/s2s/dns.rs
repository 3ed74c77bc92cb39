//! DNS SRV resolution for S2S federation (RFC 6120 Section 3.2).
//!
//! 1. Query `_xmpp-server._tcp.{domain}` SRV records
//! 2. Sort by priority (ascending), then weight (descending)
//! 3. Fall back to the domain itself on port 5269 when no SRV record exists

use std::cmp::Ordering;
use std::sync::Arc;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const DEFAULT_S2S_PORT: u16 = 5269;

#[derive(Debug, Error)]
pub enum DnsError {
    /// The domain publishes a `.` SRV target: it offers no S2S service.
    #[error("domain {0} does not offer XMPP server service")]
    ServiceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

impl ResolvedTarget {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }

    pub fn fallback(domain: &str) -> Self {
        Self::new(domain, DEFAULT_S2S_PORT, 0, 0)
    }

    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type TokioResolver = Resolver<TokioConnectionProvider>;

#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
}

impl SrvResolver {
    pub fn new() -> Self {
        let resolver =
            Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default()).build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Connection targets for `domain`, best first.
    #[instrument(skip(self), name = "s2s.dns.resolve")]
    pub async fn resolve(&self, domain: &str) -> Result<Vec<ResolvedTarget>, DnsError> {
        let srv_name = format!("_xmpp-server._tcp.{domain}.");
        match self.resolver.srv_lookup(srv_name.as_str()).await {
            Ok(response) => {
                let records: Vec<&SRV> = response.iter().collect();
                if records.len() == 1 && is_root_target(records[0]) {
                    return Err(DnsError::ServiceUnavailable(domain.to_string()));
                }
                let mut targets = srv_targets(&records);
                if targets.is_empty() {
                    return Ok(vec![ResolvedTarget::fallback(domain)]);
                }
                sort_targets(&mut targets);
                debug!(count = targets.len(), "Resolved S2S targets via SRV");
                Ok(targets)
            }
            Err(e) => {
                if !is_no_records_error(&e) {
                    warn!(error = %e, "SRV lookup failed");
                }
                Ok(vec![ResolvedTarget::fallback(domain)])
            }
        }
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn is_root_target(srv: &SRV) -> bool {
    let target = srv.target().to_utf8();
    target == "." || target.is_empty()
}

fn srv_targets(records: &[&SRV]) -> Vec<ResolvedTarget> {
    records
        .iter()
        .filter(|srv| !is_root_target(srv))
        .map(|srv| {
            let target = srv.target().to_utf8();
            ResolvedTarget::new(target.trim_end_matches('.'), srv.port(), srv.priority(), srv.weight())
        })
        .collect()
}

fn sort_targets(targets: &mut [ResolvedTarget]) {
    targets.sort_by(|a, b| match a.priority.cmp(&b.priority) {
        Ordering::Equal => b.weight.cmp(&a.weight),
        other => other,
    });
}

// NoRecordsFound lives in ProtoErrorKind in hickory 0.25.
fn is_no_records_error(error: &ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto_error) = error.kind() {
        matches!(proto_error.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_target() {
        let target = ResolvedTarget::fallback("example.org");
        assert_eq!(target.address(), "example.org:5269");
    }

    #[test]
    fn test_target_sorting() {
        let mut targets = vec![
            ResolvedTarget::new("c.example.org", 5269, 20, 50),
            ResolvedTarget::new("a.example.org", 5269, 10, 30),
            ResolvedTarget::new("b.example.org", 5269, 10, 70),
            ResolvedTarget::new("d.example.org", 5270, 30, 100),
        ];
        sort_targets(&mut targets);
        let hosts: Vec<_> = targets.iter().map(|t| t.host.as_str()).collect();
        assert_eq!(hosts, ["b.example.org", "a.example.org", "c.example.org", "d.example.org"]);
    }
}
