use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use super::error::WebhookError;
use crate::errors::QiwiError;

/// Подсети, из которых QIWI отправляет уведомления.
pub const QIWI_NETWORKS: [&str; 4] = [
    "79.142.16.0/20",
    "195.189.100.0/22",
    "91.232.230.0/23",
    "91.213.51.0/24",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, QiwiError> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(QiwiError::Configuration(format!(
                "длина префикса {prefix} больше {max} для {network}"
            )));
        }
        Ok(Cidr { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = QiwiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QiwiError::Configuration(format!("некорректная подсеть: {s}"));
        let (network, prefix) = match s.trim().split_once('/') {
            Some((network, prefix)) => (network, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: IpAddr = network.parse().map_err(|_| invalid())?;
        let prefix = match prefix {
            Some(prefix) => prefix.parse().map_err(|_| invalid())?,
            None if network.is_ipv4() => 32,
            None => 128,
        };
        Cidr::new(network, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpAllowList {
    networks: Vec<Cidr>,
}

impl IpAllowList {
    pub fn new(networks: Vec<Cidr>) -> Self {
        IpAllowList { networks }
    }

    pub fn parse<I, S>(networks: I) -> Result<Self, QiwiError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let networks = networks
            .into_iter()
            .map(|network| network.as_ref().parse())
            .collect::<Result<Vec<Cidr>, _>>()?;
        Ok(IpAllowList { networks })
    }

    /// Официальные подсети QIWI.
    pub fn qiwi() -> Self {
        let networks = QIWI_NETWORKS
            .iter()
            .filter_map(|network| network.parse().ok())
            .collect();
        IpAllowList { networks }
    }

    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }
}

/// IP клиента: первый адрес из `X-Forwarded-For`, иначе адрес соединения.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    forwarded.or_else(|| peer.map(|addr| addr.ip()))
}

/// Middleware для `axum::middleware::from_fn_with_state`.
pub async fn ip_filter_middleware(
    State(allow_list): State<Arc<IpAllowList>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    match client_ip(request.headers(), peer) {
        Some(ip) if allow_list.is_allowed(&ip) => next.run(request).await,
        ip => {
            warn!(ip = ?ip, "Rejected webhook from address outside allow list");
            WebhookError::Forbidden.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_membership() {
        let net: Cidr = "79.142.16.0/20".parse().unwrap();
        assert!(net.contains(&ip("79.142.16.2")));
        assert!(net.contains(&ip("79.142.31.255")));
        assert!(!net.contains(&ip("79.142.32.0")));
        assert!(!net.contains(&ip("10.0.0.5")));
        assert!(!net.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn edge_prefixes() {
        let everything: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(&ip("8.8.8.8")));

        let single: Cidr = "10.0.0.5".parse().unwrap();
        assert_eq!(single.to_string(), "10.0.0.5/32");
        assert!(single.contains(&ip("10.0.0.5")));
        assert!(!single.contains(&ip("10.0.0.6")));

        let v6: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(v6.contains(&ip("2001:db8:1::1")));
        assert!(!v6.contains(&ip("2001:db9::1")));
    }

    #[test]
    fn rejects_malformed_networks() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }

    #[test]
    fn qiwi_allow_list_contains_published_ranges() {
        let allow = IpAllowList::qiwi();
        assert!(allow.is_allowed(&ip("79.142.16.2")));
        assert!(allow.is_allowed(&ip("195.189.101.1")));
        assert!(allow.is_allowed(&ip("91.232.231.10")));
        assert!(allow.is_allowed(&ip("91.213.51.200")));
        assert!(!allow.is_allowed(&ip("127.0.0.1")));
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "79.142.16.2, 10.0.0.1".parse().unwrap());
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 443);

        assert_eq!(client_ip(&headers, Some(peer)), Some(ip("79.142.16.2")));
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), Some(ip("10.0.0.5")));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn garbage_forwarded_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "not-an-ip".parse().unwrap());
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(79, 142, 16, 9)), 443);
        assert_eq!(client_ip(&headers, Some(peer)), Some(ip("79.142.16.9")));
    }

    #[test]
    fn allow_list_deserializes_from_strings() {
        let allow: IpAllowList =
            serde_json::from_str(r#"{"networks": ["79.142.16.0/20"]}"#).unwrap();
        assert!(allow.is_allowed(&ip("79.142.16.2")));
        assert!(serde_json::from_str::<IpAllowList>(r#"{"networks": ["bad"]}"#).is_err());
    }
}
