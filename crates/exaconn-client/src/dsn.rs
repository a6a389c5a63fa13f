use exaconn_core::error::{ExaError, Result};
use exaconn_core::host::{Fingerprint, Host, DEFAULT_PORT};
use rand::seq::SliceRandom;
use std::net::IpAddr;
use tracing::debug;

/// One hostname derived from a connection string, before DNS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    pub port: u16,
    pub fingerprint: Option<Fingerprint>,
}

/// Expands a connection string into host specs without touching DNS.
///
/// Parts are comma separated. Each part is
/// `NAME[NN..MM[SUFFIX]][/FINGERPRINT][:PORT]`; the range expands inclusively
/// and is zero padded to the width of `NN`. A part without a port gets
/// [`DEFAULT_PORT`].
pub fn parse(dsn: &str) -> Result<Vec<HostSpec>> {
    if dsn.trim().is_empty() {
        return Err(ExaError::Dsn("connection string is empty".into()));
    }
    let mut specs = Vec::new();
    for part in dsn.split(',') {
        specs.extend(parse_part(part.trim())?);
    }
    Ok(specs)
}

fn invalid_part(part: &str) -> ExaError {
    ExaError::Dsn(format!("could not parse connection string part '{part}'"))
}

fn parse_part(part: &str) -> Result<Vec<HostSpec>> {
    if part.is_empty() {
        return Err(invalid_part(part));
    }
    let (rest, port) = match part.rsplit_once(':') {
        Some((rest, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid_part(part))?;
            (rest, port)
        }
        None => (part, DEFAULT_PORT),
    };
    let (name, fingerprint) = match rest.split_once('/') {
        Some((name, fp)) if !fp.is_empty() && fp.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (name, Some(Fingerprint::parse(fp)))
        }
        Some(_) => return Err(invalid_part(part)),
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(invalid_part(part));
    }

    let names = match name.split_once("..") {
        Some((left, right)) => expand_range(part, left, right)?,
        None => vec![name.to_string()],
    };
    Ok(names
        .into_iter()
        .map(|name| HostSpec {
            name,
            port,
            fingerprint: fingerprint.clone(),
        })
        .collect())
}

fn expand_range(part: &str, left: &str, right: &str) -> Result<Vec<String>> {
    let prefix = left.trim_end_matches(|c: char| c.is_ascii_digit());
    let lower = &left[prefix.len()..];
    let upper_len = right.len() - right.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let (upper, suffix) = right.split_at(upper_len);
    if prefix.is_empty() || lower.is_empty() || upper.is_empty() {
        return Err(invalid_part(part));
    }
    let start: u64 = lower.parse().map_err(|_| invalid_part(part))?;
    let end: u64 = upper.parse().map_err(|_| invalid_part(part))?;
    if start > end {
        return Err(ExaError::Dsn(format!(
            "connection string part '{part}' contains an invalid range, lower bound is higher than upper bound"
        )));
    }
    let width = lower.len();
    Ok((start..=end)
        .map(|n| format!("{prefix}{n:0width$}{suffix}"))
        .collect())
}

/// Parses, resolves every derived hostname, and shuffles the result.
///
/// Every distinct address of a hostname becomes its own [`Host`].
pub async fn resolve(dsn: &str) -> Result<Vec<Host>> {
    let mut hosts = Vec::new();
    for spec in parse(dsn)? {
        let addrs = tokio::net::lookup_host((spec.name.as_str(), spec.port))
            .await
            .map_err(|e| ExaError::Dsn(format!("could not resolve hostname '{}': {e}", spec.name)))?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(ExaError::Dsn(format!(
                "could not resolve hostname '{}': no addresses",
                spec.name
            )));
        }
        debug!(host = %spec.name, addresses = ips.len(), "resolved");
        hosts.extend(ips.into_iter().map(|ip| Host {
            display_name: spec.name.clone(),
            resolved_ip: ip,
            port: spec.port,
            fingerprint: spec.fingerprint.clone(),
        }));
    }
    hosts.shuffle(&mut rand::thread_rng());
    Ok(hosts)
}
