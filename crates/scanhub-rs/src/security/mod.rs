use std::net::IpAddr;

use ipnet::IpNet;
use url::{Host, Url};

/// Networks that are never scanned: private, shared, documentation and reserved space.
const RESTRICTED_NETS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "100::/64",
    "2001::/23",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "fec0::/10",
];

/// Whether `ip` is loopback, private, reserved or otherwise not a public address.
pub fn is_restricted_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    if let IpAddr::V4(v4) = ip {
        if v4.is_broadcast() {
            return true;
        }
    }
    RESTRICTED_NETS
        .iter()
        .filter_map(|net| net.parse::<IpNet>().ok())
        .any(|net| net.contains(&ip))
}

/// Whether `host` equals or is a subdomain of one of `allowed`; an empty list allows all.
pub fn domain_allowed(host: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    allowed.iter().any(|domain| {
        let domain = domain.trim().trim_matches('.').to_ascii_lowercase();
        !domain.is_empty()
            && (host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

fn is_localhost(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}

/// Parses a target URL and checks that it may be scanned.
///
/// Localhost and non-public IP addresses are always rejected; domain names must
/// fall under `allowed_domains` when that list is non-empty. Returns the URL with
/// trailing slashes removed, or the reason it is rejected.
pub fn validate_target_url(raw: &str, allowed_domains: &[String]) -> Result<String, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }

    match url.host() {
        None => return Err("URL has no host".to_string()),
        Some(Host::Domain(domain)) => {
            if domain.is_empty() {
                return Err("URL has no host".to_string());
            }
            if is_localhost(domain) {
                return Err("scans of localhost are not allowed".to_string());
            }
            if !domain_allowed(domain, allowed_domains) {
                return Err(format!("domain {domain} is not authorized for scanning"));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if is_restricted_ip(IpAddr::V4(ip)) {
                return Err("private, reserved or loopback addresses are not allowed".to_string());
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_restricted_ip(IpAddr::V6(ip)) {
                return Err("private, reserved or loopback addresses are not allowed".to_string());
            }
        }
    }

    Ok(raw.trim().trim_end_matches('/').to_string())
}
