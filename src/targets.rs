use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::types::Endpoint;

/// Parse target list content into a deduplicated list of endpoints.
///
/// Supported formats per line (or per comma separated item):
/// - single address: `1.1.1.1`, `2606:4700::1111`
/// - address with port: `1.1.1.1:8443`, `[2606:4700::1111]:8443`
/// - IPv4 CIDR block: `104.16.0.0/24`
/// - comments: everything after `#` is ignored
///
/// Entries without a port use `default_port`.
pub fn parse_targets_str(s: &str, default_port: u16) -> Result<Vec<Endpoint>> {
    let mut out: Vec<Endpoint> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let endpoints = parse_item(item, default_port)
                .with_context(|| format!("line {line_no}: invalid target: {item}"))?;
            for ep in endpoints {
                if seen.insert(ep) {
                    out.push(ep);
                }
            }
        }
    }

    Ok(out)
}

/// Load targets from a file path.
pub fn load_targets_from_path(path: impl AsRef<Path>, default_port: u16) -> Result<Vec<Endpoint>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    parse_targets_str(&content, default_port)
}

/// Treat `arg` as a file path if one exists, otherwise as an inline list.
pub fn load_targets(arg: &str, default_port: u16) -> Result<Vec<Endpoint>> {
    let path = Path::new(arg);
    if path.is_file() {
        load_targets_from_path(path, default_port)
    } else {
        parse_targets_str(arg, default_port)
    }
}

fn parse_item(item: &str, default_port: u16) -> Result<Vec<Endpoint>> {
    if item.contains('/') {
        let net: IpNet = item.parse()?;
        return match net {
            IpNet::V4(n4) => Ok(expand_ipv4net_hosts(n4)
                .into_iter()
                .map(|ip| Endpoint::new(IpAddr::V4(ip), default_port))
                .collect()),
            IpNet::V6(_) => bail!("IPv6 ranges are not supported, list addresses individually"),
        };
    }
    if let Ok(addr) = item.parse::<SocketAddr>() {
        if addr.port() == 0 {
            bail!("port out of range: 0");
        }
        return Ok(vec![Endpoint::from(addr)]);
    }
    let ip: IpAddr = item.parse()?;
    Ok(vec![Endpoint::new(ip, default_port)])
}

/// Host addresses of an IPv4 network. Network and broadcast addresses are
/// skipped unless the block is too small to have any (/31, /32).
fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end - start <= 1 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::from(s.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn parse_single_addresses_with_default_port() {
        let eps = parse_targets_str("1.1.1.1\n1.0.0.1:8443\n", 443).unwrap();
        assert_eq!(eps, vec![ep("1.1.1.1:443"), ep("1.0.0.1:8443")]);
    }

    #[test]
    fn parse_cidr_excludes_network_and_broadcast() {
        let eps = parse_targets_str("192.168.1.0/30", 80).unwrap();
        assert_eq!(eps, vec![ep("192.168.1.1:80"), ep("192.168.1.2:80")]);
    }

    #[test]
    fn tiny_blocks_keep_their_addresses() {
        assert_eq!(parse_targets_str("10.0.0.7/32", 443).unwrap(), vec![ep("10.0.0.7:443")]);
        assert_eq!(parse_targets_str("10.0.0.6/31", 443).unwrap().len(), 2);
    }

    #[test]
    fn comments_commas_and_dedup() {
        let input = r#"
            # edge ranges
            1.1.1.1, 1.0.0.1   # primary
            1.1.1.1
            [2606:4700::1111]:2053
        "#;
        let eps = parse_targets_str(input, 443).unwrap();
        assert_eq!(
            eps,
            vec![ep("1.1.1.1:443"), ep("1.0.0.1:443"), ep("[2606:4700::1111]:2053")]
        );
    }

    #[test]
    fn invalid_entries_error() {
        assert!(parse_targets_str("not-an-ip\n", 443).is_err());
        assert!(parse_targets_str("2606:4700::/120\n", 443).is_err());
        assert!(parse_targets_str("1.1.1.1:0\n", 443).is_err());
    }
}
