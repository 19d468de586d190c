// General utility functions for the application
use once_cell::sync::Lazy;
use std::net::IpAddr;
use std::str::FromStr;
use url::{Host, Url};

use crate::error::AppError;

/// Hostname suffixes that never resolve to a publicly reachable relay
pub static LOCAL_HOSTNAME_SUFFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "localhost",
        ".localhost",
        ".local",
        ".localdomain",
        ".internal",
        ".lan",
        ".home.arpa",
    ]
});

/// Validates if a string represents a valid public IP address
pub fn is_valid_public_ip(ip: &str) -> bool {
    // Check if it's a valid IP format
    let parsed_ip = match IpAddr::from_str(ip) {
        Ok(addr) => addr,
        Err(_) => return false,
    };

    // Filter out private, local, and special purpose IPs
    match parsed_ip {
        IpAddr::V4(addr) => {
            let octets = addr.octets();

            // RFC 1918 (Private Use)
            if octets[0] == 10
                || (octets[0] == 172 && (octets[1] >= 16 && octets[1] <= 31))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return false;
            }

            // Loopback, link-local, and other special ranges
            if octets[0] == 0 ||     // This network
               octets[0] == 127 ||   // Loopback
               (octets[0] == 100 && (64..=127).contains(&octets[1])) || // CGNAT / tailnet space
               (octets[0] == 169 && octets[1] == 254) || // Link-local
               (octets[0] == 192 && octets[1] == 0 && octets[2] == 0) || // IETF Protocol
               (octets[0] == 192 && octets[1] == 0 && octets[2] == 2) || // TEST-NET-1
               (octets[0] == 198 && octets[1] == 51 && octets[2] == 100) || // TEST-NET-2
               (octets[0] == 203 && octets[1] == 0 && octets[2] == 113) || // TEST-NET-3
               octets[0] >= 224
            // Multicast, reserved and broadcast
            {
                return false;
            }

            true
        }
        IpAddr::V6(addr) => {
            let first = addr.segments()[0];
            !addr.is_loopback()
                && !addr.is_unspecified()
                // fe80::/10 link-local
                && (first & 0xffc0) != 0xfe80
                // fc00::/7 unique local
                && (first & 0xfe00) != 0xfc00
        }
    }
}

/// Check whether a hostname is one of the well-known local-only names
pub fn is_local_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    LOCAL_HOSTNAME_SUFFIXES
        .iter()
        .any(|suffix| host == suffix.trim_start_matches('.') || host.ends_with(suffix))
}

/// A normalized relay address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    /// Lowercased host; IPv6 literals keep their brackets
    pub host: String,
    pub port: u16,
    pub ip: Option<IpAddr>,
}

impl Endpoint {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the endpoint is reachable from the public internet
    pub fn is_public(&self) -> bool {
        match self.ip {
            Some(ip) => is_valid_public_ip(&ip.to_string()),
            None => !is_local_hostname(&self.host),
        }
    }
}

/// Parse a discovery address such as `1.2.3.4:443`, `derp.example.com` or
/// `https://derp.example.com:8443/` into an [`Endpoint`].
///
/// Addresses without a scheme default to https unless `protocol_hint` says http.
pub fn parse_endpoint(address: &str, protocol_hint: Option<&str>) -> Result<Endpoint, AppError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AppError::ValidationError("empty relay address".to_string()));
    }

    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        let scheme = match protocol_hint.map(|p| p.trim().to_ascii_lowercase()) {
            Some(p) if p == "http" => "http",
            _ => "https",
        };
        format!("{}://{}", scheme, address)
    };

    let url = Url::parse(&with_scheme).map_err(|e| {
        AppError::ValidationError(format!("invalid relay address {}: {}", address, e))
    })?;

    let secure = match url.scheme() {
        "https" => true,
        "http" => false,
        other => {
            return Err(AppError::ValidationError(format!(
                "unsupported scheme {} in relay address {}",
                other, address
            )))
        }
    };

    let (host, ip) = match url.host() {
        Some(Host::Ipv4(addr)) => (addr.to_string(), Some(IpAddr::V4(addr))),
        Some(Host::Ipv6(addr)) => (format!("[{}]", addr), Some(IpAddr::V6(addr))),
        Some(Host::Domain(domain)) => (domain.to_ascii_lowercase(), None),
        None => {
            return Err(AppError::ValidationError(format!(
                "relay address {} has no host",
                address
            )))
        }
    };

    let port = url.port_or_known_default().ok_or_else(|| {
        AppError::ValidationError(format!("relay address {} has no port", address))
    })?;

    Ok(Endpoint {
        secure,
        host,
        port,
        ip,
    })
}

/// Parse a bandwidth such as `2Mbps`, `500 kbps` or `1000` into bits per second
pub fn parse_bandwidth(input: &str) -> Result<u64, AppError> {
    let raw = input.trim();
    let lower = raw.to_ascii_lowercase();

    let (number, multiplier) = if let Some(n) = lower.strip_suffix("gbps") {
        (n, 1_000_000_000f64)
    } else if let Some(n) = lower.strip_suffix("mbps") {
        (n, 1_000_000f64)
    } else if let Some(n) = lower.strip_suffix("kbps") {
        (n, 1_000f64)
    } else if let Some(n) = lower.strip_suffix("bps") {
        (n, 1f64)
    } else {
        (lower.as_str(), 1f64)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| AppError::ValidationError(format!("invalid bandwidth: {}", raw)))?;

    if !value.is_finite() || value < 0.0 {
        return Err(AppError::ValidationError(format!(
            "bandwidth must be a non-negative number: {}",
            raw
        )));
    }

    Ok((value * multiplier).round() as u64)
}

/// Human readable bandwidth for log lines
pub fn format_bandwidth(bits_per_second: u64) -> String {
    let bps = bits_per_second as f64;
    if bps >= 1e9 {
        format!("{:.2} Gbps", bps / 1e9)
    } else if bps >= 1e6 {
        format!("{:.2} Mbps", bps / 1e6)
    } else if bps >= 1e3 {
        format!("{:.2} Kbps", bps / 1e3)
    } else {
        format!("{} bps", bits_per_second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_ip_filter() {
        assert!(is_valid_public_ip("8.8.8.8"));
        assert!(is_valid_public_ip("2606:4700::1111"));
        assert!(!is_valid_public_ip("10.1.2.3"));
        assert!(!is_valid_public_ip("192.168.1.1"));
        assert!(!is_valid_public_ip("127.0.0.1"));
        assert!(!is_valid_public_ip("100.100.100.100"));
        assert!(!is_valid_public_ip("fe80::1"));
        assert!(!is_valid_public_ip("::1"));
        assert!(!is_valid_public_ip("not-an-ip"));
    }

    #[test]
    fn test_local_hostnames() {
        assert!(is_local_hostname("localhost"));
        assert!(is_local_hostname("printer.local"));
        assert!(is_local_hostname("db.internal."));
        assert!(!is_local_hostname("derp.example.com"));
    }

    #[test]
    fn test_parse_endpoint_defaults_to_https() {
        let ep = parse_endpoint("1.2.3.4", None).unwrap();
        assert!(ep.secure);
        assert_eq!(ep.host, "1.2.3.4");
        assert_eq!(ep.port, 443);
        assert_eq!(ep.host_port(), "1.2.3.4:443");
        assert!(ep.ip.is_some());
    }

    #[test]
    fn test_parse_endpoint_with_scheme_and_port() {
        let ep = parse_endpoint("https://DERP.Example.com:8443/", None).unwrap();
        assert!(ep.secure);
        assert_eq!(ep.host, "derp.example.com");
        assert_eq!(ep.port, 8443);
        assert!(ep.ip.is_none());
        assert!(ep.is_public());
    }

    #[test]
    fn test_parse_endpoint_protocol_hint() {
        let ep = parse_endpoint("5.6.7.8:8080", Some("http")).unwrap();
        assert!(!ep.secure);
        assert_eq!(ep.port, 8080);

        let ep = parse_endpoint("5.6.7.8", Some("http")).unwrap();
        assert_eq!(ep.port, 80);
    }

    #[test]
    fn test_parse_endpoint_ipv6() {
        let ep = parse_endpoint("[2606:4700::1111]:443", None).unwrap();
        assert_eq!(ep.host, "[2606:4700::1111]");
        assert_eq!(ep.host_port(), "[2606:4700::1111]:443");
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert!(parse_endpoint("", None).is_err());
        assert!(parse_endpoint("ftp://1.2.3.4", None).is_err());
        assert!(parse_endpoint("https://", None).is_err());
    }

    #[test]
    fn test_private_endpoint_is_not_public() {
        assert!(!parse_endpoint("192.168.0.10:443", None).unwrap().is_public());
        assert!(!parse_endpoint("relay.local", None).unwrap().is_public());
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("2Mbps").unwrap(), 2_000_000);
        assert_eq!(parse_bandwidth("500 kbps").unwrap(), 500_000);
        assert_eq!(parse_bandwidth("1.5Gbps").unwrap(), 1_500_000_000);
        assert_eq!(parse_bandwidth("1200").unwrap(), 1200);
        assert_eq!(parse_bandwidth("64bps").unwrap(), 64);
        assert!(parse_bandwidth("fast").is_err());
        assert!(parse_bandwidth("-3Mbps").is_err());
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(2_500_000), "2.50 Mbps");
        assert_eq!(format_bandwidth(12), "12 bps");
    }
}
