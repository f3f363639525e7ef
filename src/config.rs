//! Configuration parsing: proxy lists and local NAT mappings

use std::{
    io::{self, BufRead},
    net::IpAddr,
    sync::Arc,
};

use url::Url;

use crate::{
    connect::{AddressMapper, Network},
    relay::socks5::Address,
};

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid proxy url `{url}`: {reason}")]
    InvalidProxyUrl { url: String, reason: String },
    #[error("invalid mapping `{mapping}`: {reason}")]
    InvalidMapping { mapping: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Username/password credential for a SOCKS5 proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: Option<String>,
}

/// An upstream SOCKS5 proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksAddr {
    pub addr: Address,
    pub auth: Option<Auth>,
}

/// Parses a proxy file: one address per line, blank lines and lines whose
/// first non-space character is `#` are skipped. A `#` anywhere else is part
/// of the URL and fails parsing.
pub fn parse_proxy_file<R: BufRead>(reader: R) -> Result<Vec<SocksAddr>, ConfigError> {
    let mut proxies = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        proxies.push(parse_proxy_url(line)?);
    }
    Ok(proxies)
}

/// Parses one proxy address. A bare `host:port` is treated as
/// `socks5://host:port`; any other scheme is rejected.
pub fn parse_proxy_url(proxy_url: &str) -> Result<SocksAddr, ConfigError> {
    let proxy_url = proxy_url.trim();
    let with_scheme;
    let raw = if proxy_url.contains("//") {
        proxy_url
    } else {
        with_scheme = format!("socks5://{proxy_url}");
        &with_scheme
    };

    let invalid = |reason: String| ConfigError::InvalidProxyUrl {
        url: proxy_url.to_owned(),
        reason,
    };

    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    if url.scheme() != "socks5" {
        return Err(invalid(format!("invalid socks5 scheme `{}`", url.scheme())));
    }

    let host = url
        .host_str()
        .ok_or_else(|| invalid("missing host".to_owned()))?;
    let port = url.port().ok_or_else(|| invalid("missing port".to_owned()))?;

    // Url serializes IPv6 hosts with brackets
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => Address::SocketAddress((ip, port).into()),
        Err(..) => Address::DomainNameAddress(host.to_owned(), port),
    };

    let auth = match url.username() {
        "" => None,
        username => Some(Auth {
            username: username.to_owned(),
            password: url.password().map(str::to_owned),
        }),
    };

    Ok(SocksAddr { addr, auth })
}

/// Parses a list of proxy addresses from command-line arguments
pub fn parse_proxy_urls(proxy_urls: &[String]) -> Result<Vec<SocksAddr>, ConfigError> {
    proxy_urls.iter().map(|url| parse_proxy_url(url)).collect()
}

/// Builds an address mapper from `-L` mapping arguments
pub fn parse_address_mapper(mappings: &[String]) -> Result<Arc<AddressMapper>, ConfigError> {
    let mapper = AddressMapper::new();
    for mapping in mappings {
        let (network, from_addr, target) = parse_mapping(mapping)?;
        mapper
            .insert(network, &from_addr, target)
            .map_err(|err| ConfigError::InvalidMapping {
                mapping: mapping.clone(),
                reason: err.to_string(),
            })?;
    }
    Ok(Arc::new(mapper))
}

/// Parses one `[src_host:]src_port:dst_host:dst_port[/net]` mapping.
///
/// The address part is consumed right to left: target port, target host,
/// source port, then an optional source host. Hosts may be bracketed IPv6.
/// Any residual input is an error.
pub fn parse_mapping(mapping: &str) -> Result<(Network, String, Address), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidMapping {
        mapping: mapping.to_owned(),
        reason: reason.to_owned(),
    };

    let (addr_part, network) = match mapping.split_once('/') {
        Some((addr, net)) => {
            let network = net.parse::<Network>().map_err(|_| invalid("invalid network"))?;
            (addr, network)
        }
        None => (mapping, Network::Tcp),
    };

    let (target_port, rest) = take_last_port(addr_part).ok_or_else(|| invalid("invalid target port"))?;
    let (target_host, rest) = take_last_host(rest).map_err(|reason| invalid(reason))?;
    if target_host.is_empty() {
        return Err(invalid("empty target host"));
    }
    let (from_port, rest) = take_last_port(rest).ok_or_else(|| invalid("invalid source port"))?;
    let (from_host, rest) = take_last_host(rest).map_err(|reason| invalid(reason))?;
    if !rest.is_empty() {
        return Err(invalid("invalid source address"));
    }

    let target = match target_host.parse::<IpAddr>() {
        Ok(ip) => Address::SocketAddress((ip, target_port).into()),
        Err(..) => Address::DomainNameAddress(target_host.to_owned(), target_port),
    };

    Ok((network, join_host_port(from_host, from_port), target))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Takes the port after the last `:`; the whole input is the port when no
/// colon remains
fn take_last_port(input: &str) -> Option<(u16, &str)> {
    let (rest, port) = match input.rfind(':') {
        Some(idx) if idx > 0 => (&input[..idx], &input[idx + 1..]),
        Some(idx) => ("", &input[idx + 1..]),
        None => ("", input),
    };
    port.parse::<u16>().ok().map(|port| (port, rest))
}

/// Takes the host before the previously consumed port. A trailing `]`
/// consumes a bracketed IPv6 host, which must parse as IPv6 and be preceded
/// by `:` or the start of the input.
fn take_last_host(input: &str) -> Result<(&str, &str), &'static str> {
    if input.is_empty() {
        return Ok(("", ""));
    }
    if input.ends_with(']') {
        return take_last_ipv6_host(input);
    }
    match input.rfind(':') {
        Some(idx) if idx > 0 => Ok((&input[idx + 1..], &input[..idx])),
        Some(idx) => Ok((&input[idx + 1..], "")),
        None => Ok((input, "")),
    }
}

fn take_last_ipv6_host(input: &str) -> Result<(&str, &str), &'static str> {
    let idx = match input.rfind('[') {
        Some(idx) => idx,
        None => return Err("invalid IPv6 address"),
    };
    let host = &input[idx + 1..input.len() - 1];
    let rest = if idx > 0 {
        if input.as_bytes()[idx - 1] != b':' {
            return Err("missing colon before host");
        }
        &input[..idx - 1]
    } else {
        ""
    };
    if host.parse::<std::net::Ipv6Addr>().is_err() {
        return Err("invalid IPv6 address");
    }
    Ok((host, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn socks(addr: &str) -> SocksAddr {
        SocksAddr {
            addr: match addr.parse::<std::net::SocketAddr>() {
                Ok(sa) => Address::SocketAddress(sa),
                Err(..) => {
                    let (host, port) = addr.rsplit_once(':').unwrap();
                    Address::DomainNameAddress(host.to_owned(), port.parse().unwrap())
                }
            },
            auth: None,
        }
    }

    #[test]
    fn proxy_url_ip_port() {
        let parsed = parse_proxy_url("10.10.10.10:1111").unwrap();
        assert_eq!(parsed, socks("10.10.10.10:1111"));
    }

    #[test]
    fn proxy_url_host_port() {
        let parsed = parse_proxy_url("example.com:1111").unwrap();
        assert_eq!(parsed, socks("example.com:1111"));
    }

    #[test]
    fn proxy_url_username_only() {
        let parsed = parse_proxy_url("abc@10.10.10.10:1111").unwrap();
        assert_eq!(
            parsed.auth,
            Some(Auth {
                username: "abc".to_owned(),
                password: None,
            })
        );
        assert_eq!(parsed.addr.to_string(), "10.10.10.10:1111");
    }

    #[test]
    fn proxy_url_username_password() {
        let parsed = parse_proxy_url("abc:def@example.com:1111").unwrap();
        assert_eq!(parsed.addr.to_string(), "example.com:1111");
        assert_eq!(
            parsed.auth,
            Some(Auth {
                username: "abc".to_owned(),
                password: Some("def".to_owned()),
            })
        );
    }

    #[test]
    fn proxy_url_explicit_scheme() {
        let parsed = parse_proxy_url("socks5://10.10.10.10:1111").unwrap();
        assert_eq!(parsed, socks("10.10.10.10:1111"));
    }

    #[test]
    fn proxy_url_invalid_scheme() {
        assert!(parse_proxy_url("socks3://x:1").is_err());
    }

    #[test]
    fn proxy_url_invalid_inputs() {
        for url in [
            "abc@def:10.10.10.10:1111",
            "10.10.10.10:1111 #hello",
            "10.10.10.10:abc",
            "10.10.10.10",
        ] {
            assert!(parse_proxy_url(url).is_err(), "{url} should fail");
        }
    }

    #[test]
    fn proxy_file_skips_blanks_and_comments() {
        for input in ["", "   ", "\n", "  \n   ", "#", "  #  ", " # \n#  "] {
            let parsed = parse_proxy_file(Cursor::new(input)).unwrap();
            assert!(parsed.is_empty(), "{input:?} should parse to an empty list");
        }
    }

    #[test]
    fn proxy_file_multiple_lines() {
        let parsed = parse_proxy_file(Cursor::new("10.10.10.10:1111\n20.20.20.20:2222")).unwrap();
        assert_eq!(parsed, vec![socks("10.10.10.10:1111"), socks("20.20.20.20:2222")]);

        let parsed = parse_proxy_file(Cursor::new("  10.10.10.10:1111   ")).unwrap();
        assert_eq!(parsed, vec![socks("10.10.10.10:1111")]);
    }

    #[test]
    fn proxy_file_inline_comment_is_an_error() {
        assert!(parse_proxy_file(Cursor::new("10.10.10.10:1111 #hello")).is_err());
    }

    #[test]
    fn proxy_file_error_position_independent() {
        assert!(parse_proxy_file(Cursor::new("10.10.10.10:1111\n10.10.10.13")).is_err());
        assert!(parse_proxy_file(Cursor::new(" 10.10.10.13\n10.10.10.10:1111")).is_err());
    }

    #[test]
    fn mapping_full_with_ipv6_target() {
        let (network, from, target) = parse_mapping("1.1.1.1:53:[::1]:5353/udp").unwrap();
        assert_eq!(network, Network::Udp);
        assert_eq!(from, "1.1.1.1:53");
        assert_eq!(target.to_string(), "[::1]:5353");
    }

    #[test]
    fn mapping_invalid_ipv6_target() {
        assert!(parse_mapping("1.1.1.1:53:[abc]:5353/udp").is_err());
    }

    #[test]
    fn mapping_bare_port_source() {
        let (network, from, target) = parse_mapping("53:127.0.0.1:5341/udp").unwrap();
        assert_eq!(network, Network::Udp);
        assert_eq!(from, ":53");
        assert_eq!(target.to_string(), "127.0.0.1:5341");
    }

    #[test]
    fn mapping_missing_source_port() {
        assert!(parse_mapping("127.0.0.1:5353/udp").is_err());
    }

    #[test]
    fn mapping_defaults_to_tcp() {
        let (network, from, target) = parse_mapping("2.2.2.2:8080:127.0.0.1:5341").unwrap();
        assert_eq!(network, Network::Tcp);
        assert_eq!(from, "2.2.2.2:8080");
        assert_eq!(target.to_string(), "127.0.0.1:5341");
    }

    #[test]
    fn mapping_residual_input_rejected() {
        assert!(parse_mapping("x:1.1.1.1:53:127.0.0.1:5341/udp").is_err());
    }

    #[test]
    fn mapper_built_from_bare_port_matches_any_host() {
        let mapper = parse_address_mapper(&["53:127.0.0.1:5341/udp".to_owned()]).unwrap();
        let target = mapper.lookup(Network::Udp, "8.8.8.8:53").unwrap();
        assert_eq!(target.to_string(), "127.0.0.1:5341");
    }

    #[test]
    fn mapping_invalid_network_rejected() {
        assert!(parse_mapping("53:127.0.0.1:5341/icmp").is_err());
    }
}
