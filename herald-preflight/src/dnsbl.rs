//! DNS blacklist survey.
//!
//! IP listings: for IPv4 `a.b.c.d` and zone `z`, an A-record lookup of
//! `d.c.b.a.z`; resolution means listed. Domain listings: `domain.z`.
//! NXDOMAIN means clean; other resolver failures are recorded but treated
//! as clean (the survey is advisory unless the gate is told otherwise).

use std::net::{IpAddr, Ipv4Addr};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use herald_common::Domain;
use tracing::{debug, warn};

/// Result of one survey over the configured zones.
#[derive(Debug, Clone, Default)]
pub struct BlacklistSurvey {
    /// `(ip, zone)` pairs that resolved.
    pub ip_listed: Vec<(Ipv4Addr, String)>,
    /// `(domain, zone)` pairs that resolved. Informational by default.
    pub domain_listed: Vec<(String, String)>,
    /// IPs of the injection host that were checked.
    pub checked_ips: Vec<Ipv4Addr>,
    /// Zones that failed to answer either way.
    pub errors: Vec<String>,
}

impl BlacklistSurvey {
    /// Whether any injection-host IP sits on a configured RBL.
    #[must_use]
    pub fn ip_blocked(&self) -> bool {
        !self.ip_listed.is_empty()
    }

    #[must_use]
    pub fn summary(&self) -> String {
        if self.ip_listed.is_empty() && self.domain_listed.is_empty() {
            return "clean".to_string();
        }
        let mut parts = Vec::new();
        for (ip, zone) in &self.ip_listed {
            parts.push(format!("{ip} listed in {zone}"));
        }
        for (domain, zone) in &self.domain_listed {
            parts.push(format!("{domain} listed in {zone}"));
        }
        parts.join("; ")
    }
}

pub struct DnsblClient {
    resolver: TokioAsyncResolver,
    rbl_zones: Vec<String>,
    dbl_zones: Vec<String>,
}

impl std::fmt::Debug for DnsblClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsblClient")
            .field("rbl_zones", &self.rbl_zones)
            .field("dbl_zones", &self.dbl_zones)
            .finish_non_exhaustive()
    }
}

impl DnsblClient {
    #[must_use]
    pub fn new(rbl_zones: Vec<String>, dbl_zones: Vec<String>) -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            rbl_zones,
            dbl_zones,
        }
    }

    /// Survey the injection host's IPv4 addresses against the RBL zones and
    /// the sender domain against the DBL zones.
    pub async fn survey(&self, smtp_host: &str, sender_domain: Option<&Domain>) -> BlacklistSurvey {
        let mut survey = BlacklistSurvey::default();

        let ips = self.resolve_host(smtp_host).await;
        survey.checked_ips.clone_from(&ips);

        for ip in &ips {
            for zone in &self.rbl_zones {
                let octets = ip.octets();
                let query = format!(
                    "{}.{}.{}.{}.{zone}.",
                    octets[3], octets[2], octets[1], octets[0]
                );
                match self.is_listed(&query).await {
                    Some(true) => survey.ip_listed.push((*ip, zone.clone())),
                    Some(false) => {}
                    None => survey.errors.push(zone.clone()),
                }
            }
        }

        if let Some(domain) = sender_domain {
            for zone in &self.dbl_zones {
                let query = format!("{domain}.{zone}.");
                match self.is_listed(&query).await {
                    Some(true) => survey.domain_listed.push((domain.to_string(), zone.clone())),
                    Some(false) => {}
                    None => survey.errors.push(zone.clone()),
                }
            }
        }

        debug!(
            host = smtp_host,
            listed = survey.ip_listed.len(),
            domain_listed = survey.domain_listed.len(),
            "blacklist survey complete"
        );
        survey
    }

    async fn resolve_host(&self, host: &str) -> Vec<Ipv4Addr> {
        // A literal IP needs no lookup.
        if let Ok(IpAddr::V4(ip)) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        if host.parse::<IpAddr>().is_ok() {
            return Vec::new();
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!(host, error = %e, "failed to resolve injection host");
                Vec::new()
            }
        }
    }

    /// `Some(true)` listed, `Some(false)` clean, `None` when the zone did
    /// not answer conclusively.
    async fn is_listed(&self, query: &str) -> Option<bool> {
        match self.resolver.ipv4_lookup(query).await {
            Ok(lookup) => Some(lookup.iter().next().is_some()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Some(false),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survey_summary() {
        let mut survey = BlacklistSurvey::default();
        assert_eq!(survey.summary(), "clean");
        assert!(!survey.ip_blocked());

        survey
            .ip_listed
            .push((Ipv4Addr::new(192, 0, 2, 1), "zen.spamhaus.org".to_string()));
        survey
            .domain_listed
            .push(("sender.example".to_string(), "dbl.spamhaus.org".to_string()));
        assert!(survey.ip_blocked());
        assert_eq!(
            survey.summary(),
            "192.0.2.1 listed in zen.spamhaus.org; sender.example listed in dbl.spamhaus.org"
        );
    }
}
