//! Client IP resolution behind trusted proxies.
//!
//! A request that crossed nginx, an ingress and a load balancer carries the
//! hops it went through in forwarding headers. The resolver rebuilds that
//! chain as an ordered list:
//!
//! ```text
//! [ claimed client, proxy 1, proxy 2, …, socket peer ]
//!   index 0                               last index
//! ```
//!
//! Index `0` is the most-forwarded address (what the client claims to be).
//! The last index is the nearest hop, the one address the server saw with
//! its own eyes. Headers are only read when trust is switched on; otherwise a
//! client could forge its own address with one extra header line.
//!
//! Resolution never fails. An unparsable socket address becomes `""`, a
//! malformed header entry is dropped.

use std::net::IpAddr;

use http::HeaderMap;
use serde::Deserialize;

/// Resolves the ordered address chain for one request.
///
/// Implemented by [`IpResolver`]; swap in your own implementation through
/// [`Server::ip_resolver`](crate::Server::ip_resolver) if your proxies speak a
/// different dialect.
pub trait ResolveIp: Send + Sync + 'static {
    /// Returns the address chain, never empty. `remote_addr` is the raw
    /// `host:port` string of the socket peer.
    fn resolve(&self, headers: &HeaderMap, remote_addr: &str) -> Vec<String>;
}

/// The default resolver: reads `X-Forwarded-For` and `Forwarded` when trusted.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IpResolver {
    /// Headers to consult, in order. Header names are case-insensitive.
    pub trusted_headers: Vec<String>,
    /// Whether the headers above are honoured at all.
    pub trust_headers: bool,
}

impl IpResolver {
    pub fn new<I, S>(trusted_headers: I, trust_headers: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_headers: trusted_headers.into_iter().map(Into::into).collect(),
            trust_headers,
        }
    }
}

impl Default for IpResolver {
    fn default() -> Self {
        Self::new(["X-Forwarded-For", "Forwarded"], false)
    }
}

impl ResolveIp for IpResolver {
    fn resolve(&self, headers: &HeaderMap, remote_addr: &str) -> Vec<String> {
        let peer = peer_ip(remote_addr);
        if !self.trust_headers || self.trusted_headers.is_empty() {
            return vec![peer];
        }

        let mut ips = Vec::with_capacity(2);
        for name in &self.trusted_headers {
            let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if name.eq_ignore_ascii_case("x-forwarded-for") {
                ips.extend(x_forwarded_for(value));
            } else if name.eq_ignore_ascii_case("forwarded") {
                ips.extend(forwarded(value));
            }
        }

        // The peer terminates the chain unless a proxy already wrote itself in.
        if ips.last() != Some(&peer) {
            ips.push(peer);
        }
        ips
    }
}

/// `X-Forwarded-For: client, proxy1, proxy2`
fn x_forwarded_for(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|ip| ip.parse::<IpAddr>().is_ok())
        .map(str::to_owned)
}

/// RFC 7239: `Forwarded: for=192.0.2.60;proto=http, for="[2001:db8::17]:4711"`
///
/// Only the `for` parameter is used. Obfuscated identifiers (`unknown`,
/// `_hidden`) are not addresses and are dropped like any malformed entry.
fn forwarded(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            key.trim().eq_ignore_ascii_case("for").then(|| val.trim().trim_matches('"'))
        })
        .filter_map(|node| {
            let host = match node.strip_prefix('[') {
                Some(rest) => rest.split_once(']')?.0,
                None => match node.split_once(':') {
                    Some((host, port)) if !port.contains(':') => host,
                    _ => node,
                },
            };
            host.parse::<IpAddr>().ok().map(|_| host.to_owned())
        })
}

/// Host part of the socket peer, or `""` when it is not an IP literal.
fn peer_ip(remote_addr: &str) -> String {
    split_host(remote_addr.trim())
        .and_then(|host| host.parse::<IpAddr>().ok())
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

/// `"1.2.3.4:80"` → `"1.2.3.4"`, `"[::1]:80"` → `"::1"`. A bare IPv6 address
/// without brackets is ambiguous and rejected.
fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return tail.starts_with(':').then_some(host);
    }
    let (host, _port) = addr.rsplit_once(':')?;
    (!host.contains(':')).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, http::HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn no_headers_configured_yields_peer_only() {
        let resolver = IpResolver::new(Vec::<String>::new(), false);
        let ips = resolver.resolve(&HeaderMap::new(), "192.168.1.1:1234");
        assert_eq!(ips, ["192.168.1.1"]);
    }

    #[test]
    fn untrusted_headers_are_ignored() {
        let resolver = IpResolver::new(["X-Forwarded-For"], false);
        let h = headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        assert_eq!(resolver.resolve(&h, "192.168.1.1:1234"), ["192.168.1.1"]);
    }

    #[test]
    fn trusted_chain_gets_peer_appended() {
        let resolver = IpResolver::new(["X-Forwarded-For"], true);
        let h = headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2")]);
        assert_eq!(
            resolver.resolve(&h, "192.168.1.1:1234"),
            ["10.0.0.1", "10.0.0.2", "192.168.1.1"]
        );
    }

    #[test]
    fn trusted_chain_already_ending_in_peer_is_not_duplicated() {
        let resolver = IpResolver::new(["X-Forwarded-For"], true);
        let h = headers(&[("x-forwarded-for", "10.0.0.1, 10.0.0.2, 192.168.1.1")]);
        assert_eq!(
            resolver.resolve(&h, "192.168.1.1:1234"),
            ["10.0.0.1", "10.0.0.2", "192.168.1.1"]
        );
    }

    #[test]
    fn malformed_header_entries_are_dropped() {
        let resolver = IpResolver::new(["X-Forwarded-For"], true);
        let h = headers(&[("x-forwarded-for", "invalid, 10.0.0.2")]);
        assert_eq!(resolver.resolve(&h, "192.168.1.1:1234"), ["10.0.0.2", "192.168.1.1"]);
    }

    #[test]
    fn unparsable_remote_addr_becomes_empty() {
        let resolver = IpResolver::new(Vec::<String>::new(), false);
        assert_eq!(resolver.resolve(&HeaderMap::new(), "invalid"), [""]);
        assert_eq!(resolver.resolve(&HeaderMap::new(), "host.local:80"), [""]);
    }

    #[test]
    fn unparsable_remote_addr_still_terminates_trusted_chain() {
        let resolver = IpResolver::new(["X-Forwarded-For"], true);
        let h = headers(&[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(resolver.resolve(&h, "invalid"), ["10.0.0.1", ""]);
    }

    #[test]
    fn ipv6_peer_is_unbracketed() {
        let resolver = IpResolver::default();
        assert_eq!(resolver.resolve(&HeaderMap::new(), "[::1]:8080"), ["::1"]);
    }

    #[test]
    fn missing_trusted_header_yields_peer_only() {
        let resolver = IpResolver::new(["X-Forwarded-For"], true);
        assert_eq!(resolver.resolve(&HeaderMap::new(), "192.168.1.1:1234"), ["192.168.1.1"]);
    }

    #[test]
    fn headers_concatenate_in_configured_order() {
        let resolver = IpResolver::new(["Forwarded", "X-Forwarded-For"], true);
        let h = headers(&[
            ("x-forwarded-for", "10.0.0.3"),
            ("forwarded", r#"for=10.0.0.1;proto=https, for="[2001:db8::17]:4711", for=10.0.0.2:80"#),
        ]);
        assert_eq!(
            resolver.resolve(&h, "192.168.1.1:1234"),
            ["10.0.0.1", "2001:db8::17", "10.0.0.2", "10.0.0.3", "192.168.1.1"]
        );
    }

    #[test]
    fn forwarded_obfuscated_nodes_are_dropped() {
        let resolver = IpResolver::new(["Forwarded"], true);
        let h = headers(&[("forwarded", "for=unknown, for=_hidden, by=10.9.9.9")]);
        assert_eq!(resolver.resolve(&h, "192.168.1.1:1234"), ["192.168.1.1"]);
    }

    #[test]
    fn unknown_header_names_carry_no_addresses() {
        let resolver = IpResolver::new(["X-Real-Ip"], true);
        let h = headers(&[("x-real-ip", "10.0.0.1")]);
        assert_eq!(resolver.resolve(&h, "192.168.1.1:1234"), ["192.168.1.1"]);
    }

    #[test]
    fn deserialises_with_defaults() {
        let resolver: IpResolver = serde_json::from_str(r#"{"trust_headers": true}"#).unwrap();
        assert!(resolver.trust_headers);
        assert_eq!(resolver.trusted_headers, ["X-Forwarded-For", "Forwarded"]);
    }
}
