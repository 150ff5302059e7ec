//! DNS-backed collaborator for SPF/DKIM/DMARC lookups, wrapping `mail-auth`'s
//! own [`mail_auth::Resolver`]. Mirrors the mock/real split the codebase
//! already uses for its outbound MX resolver (`handler::dns::DnsResolver`),
//! except the mock here stands in for DNS answers rather than hickory's
//! lookup types, since those are opaque outside this crate.

use std::collections::HashMap;
use std::net::IpAddr;

use mail_auth::{AuthenticatedMessage, DkimResult, DmarcResult, SpfResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("failed to build DNS resolver: {0}")]
    Build(String),
    #[error("could not read mock DNS source {0}: {1}")]
    MockSource(String, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfVerdict {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    TempError,
    PermError,
    None,
}

impl SpfVerdict {
    fn from_mail_auth(r: &SpfResult) -> Self {
        match r {
            SpfResult::Pass => Self::Pass,
            SpfResult::Fail => Self::Fail,
            SpfResult::SoftFail => Self::SoftFail,
            SpfResult::Neutral => Self::Neutral,
            SpfResult::TempError => Self::TempError,
            SpfResult::PermError => Self::PermError,
            SpfResult::None => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimVerdict {
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmarcDecision {
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    pub enforced: bool,
}

/// A handful of canned DNS answers keyed by domain, loaded from the file
/// named by `MOCKDNSSOURCE` (SPEC_FULL.md §6.3). One line per record:
/// `domain spf|dmarc|dkim value`.
#[derive(Debug, Clone, Default)]
pub struct MockZone {
    spf: HashMap<String, String>,
    dmarc: HashMap<String, String>,
    dkim_ok: HashMap<String, bool>,
}

impl MockZone {
    pub fn from_file(path: &str) -> Result<Self, ResolverError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ResolverError::MockSource(path.to_owned(), e))?;
        let mut zone = MockZone::default();
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            let (Some(domain), Some(kind), Some(value)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            match kind {
                "spf" => {
                    zone.spf.insert(domain.to_owned(), value.to_owned());
                }
                "dmarc" => {
                    zone.dmarc.insert(domain.to_owned(), value.to_owned());
                }
                "dkim" => {
                    zone.dkim_ok.insert(domain.to_owned(), value == "pass");
                }
                _ => {}
            }
        }
        Ok(zone)
    }
}

pub enum DnsResolver {
    Real(mail_auth::Resolver),
    Mock(MockZone),
}

impl DnsResolver {
    pub fn new_real() -> Result<Self, ResolverError> {
        let resolver =
            mail_auth::Resolver::new_cloudflare_tls().map_err(|e| ResolverError::Build(e.to_string()))?;
        Ok(Self::Real(resolver))
    }

    pub fn new_mock(source_path: &str) -> Result<Self, ResolverError> {
        Ok(Self::Mock(MockZone::from_file(source_path)?))
    }

    pub async fn verify_spf_sender(
        &self,
        client_ip: IpAddr,
        helo_domain: &str,
        host_domain: &str,
        mail_from: &str,
    ) -> SpfVerdict {
        match self {
            Self::Real(resolver) => {
                let output = resolver
                    .verify_spf_sender(client_ip, helo_domain, host_domain, mail_from)
                    .await;
                SpfVerdict::from_mail_auth(output.result())
            }
            Self::Mock(zone) => {
                let domain = mail_from.split('@').nth(1).unwrap_or(mail_from);
                match zone.spf.get(domain).map(String::as_str) {
                    Some("pass") => SpfVerdict::Pass,
                    Some("softfail") => SpfVerdict::SoftFail,
                    Some("fail") => SpfVerdict::Fail,
                    Some(_) => SpfVerdict::Neutral,
                    None => SpfVerdict::None,
                }
            }
        }
    }

    pub async fn verify_dkim(&self, message: &AuthenticatedMessage<'_>) -> Vec<DkimVerdict> {
        match self {
            Self::Real(resolver) => resolver
                .verify_dkim(message)
                .await
                .iter()
                .map(|o| DkimVerdict {
                    pass: *o.result() == DkimResult::Pass,
                })
                .collect(),
            Self::Mock(zone) => {
                let domain = message
                    .from()
                    .first()
                    .and_then(|f| f.split('@').nth(1))
                    .unwrap_or_default();
                vec![DkimVerdict {
                    pass: zone.dkim_ok.get(domain).copied().unwrap_or(false),
                }]
            }
        }
    }

    /// Step 5: DMARC alignment, delegating to `mail-auth`'s own alignment
    /// logic for the real resolver, since it already has the DKIM signing
    /// domain and published policy at hand.
    pub async fn verify_dmarc(
        &self,
        message: &AuthenticatedMessage<'_>,
        dkim: &[DkimVerdict],
        header_from_domain: &str,
        spf: SpfVerdict,
    ) -> DmarcDecision {
        match self {
            Self::Real(resolver) => {
                let spf_result = match spf {
                    SpfVerdict::Pass => SpfResult::Pass,
                    SpfVerdict::Fail => SpfResult::Fail,
                    SpfVerdict::SoftFail => SpfResult::SoftFail,
                    SpfVerdict::Neutral => SpfResult::Neutral,
                    SpfVerdict::TempError => SpfResult::TempError,
                    SpfVerdict::PermError => SpfResult::PermError,
                    SpfVerdict::None => SpfResult::None,
                };
                let dkim_results: Vec<_> = resolver.verify_dkim(message).await;
                let output = resolver
                    .verify_dmarc(message, &dkim_results, header_from_domain, &spf_result)
                    .await;
                DmarcDecision {
                    spf_aligned: *output.spf_result() == DmarcResult::Pass,
                    dkim_aligned: *output.dkim_result() == DmarcResult::Pass,
                    enforced: output.policy() != mail_auth::dmarc::Policy::None,
                }
            }
            Self::Mock(zone) => {
                let enforced = zone
                    .dmarc
                    .get(header_from_domain)
                    .map(|p| p == "reject" || p == "quarantine")
                    .unwrap_or(false);
                DmarcDecision {
                    spf_aligned: spf == SpfVerdict::Pass,
                    dkim_aligned: dkim.iter().any(|d| d.pass),
                    enforced,
                }
            }
        }
    }
}
