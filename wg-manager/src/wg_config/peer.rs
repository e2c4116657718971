//! The `[Peer]` section

use super::attribute::{join_list, split_list, Attribute};
use super::error::{BadConfigError, Location, Reason, Section};
use super::inet::{parse_network, InetEndpoint};
use super::{parse_number, push_unique};
use crate::keys::Key;
use ipnet::IpNet;
use std::fmt::Write as _;

/// A remote WireGuard endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: Key,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<InetEndpoint>,
    pub pre_shared_key: Option<Key>,
    /// Keepalive interval in seconds, `None` when disabled
    pub persistent_keepalive: Option<u16>,
}

impl Peer {
    /// A peer with only a public key
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            pre_shared_key: None,
            persistent_keepalive: None,
        }
    }

    /// Build a peer from the attribute lines of one `[Peer]` section
    pub fn parse<'a, I>(lines: I) -> Result<Self, BadConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut public_key = None;
        let mut allowed_ips = Vec::new();
        let mut endpoint = None;
        let mut pre_shared_key = None;
        let mut persistent_keepalive = None;

        for line in lines {
            let attribute = Attribute::parse(line).ok_or_else(|| {
                BadConfigError::new(Section::Peer, Location::TopLevel, Reason::SyntaxError, Some(line))
            })?;

            let location = match attribute.lower_key().as_str() {
                "allowedips" => Location::AllowedIps,
                "endpoint" => Location::Endpoint,
                "persistentkeepalive" => Location::PersistentKeepalive,
                "presharedkey" => Location::PreSharedKey,
                "publickey" => Location::PublicKey,
                _ => {
                    return Err(BadConfigError::new(
                        Section::Peer,
                        Location::TopLevel,
                        Reason::UnknownAttribute,
                        Some(attribute.key),
                    ))
                }
            };

            let value = attribute.value;
            if value.is_empty() {
                return Err(BadConfigError::new(
                    Section::Peer,
                    location,
                    Reason::MissingValue,
                    None,
                ));
            }
            let bad = |cause| BadConfigError::from_value(Section::Peer, location, value, cause);

            match location {
                Location::AllowedIps => {
                    for item in split_list(value) {
                        push_unique(&mut allowed_ips, parse_network(item).map_err(bad)?);
                    }
                }
                Location::Endpoint => {
                    endpoint = Some(InetEndpoint::parse(value).map_err(bad)?);
                }
                Location::PersistentKeepalive => {
                    let seconds = parse_number(Section::Peer, location, value, 0, 65535)?;
                    persistent_keepalive = u16::try_from(seconds).ok().filter(|s| *s != 0);
                }
                Location::PreSharedKey => {
                    pre_shared_key = Some(Key::from_base64(value).map_err(|e| bad(e.into()))?);
                }
                Location::PublicKey => {
                    public_key = Some(Key::from_base64(value).map_err(|e| bad(e.into()))?);
                }
                _ => {}
            }
        }

        let public_key = public_key.ok_or_else(|| {
            BadConfigError::new(
                Section::Peer,
                Location::PublicKey,
                Reason::MissingAttribute,
                None,
            )
        })?;

        Ok(Self {
            public_key,
            allowed_ips,
            endpoint,
            pre_shared_key,
            persistent_keepalive,
        })
    }

    /// `Key = Value` lines for a wg-quick file, without the section header
    pub fn to_wg_quick_string(&self) -> String {
        let mut out = String::new();
        if !self.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", join_list(&self.allowed_ips));
        }
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if let Some(seconds) = self.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", seconds);
        }
        if let Some(psk) = &self.pre_shared_key {
            let _ = writeln!(out, "PreSharedKey = {}", psk.to_base64());
        }
        let _ = writeln!(out, "PublicKey = {}", self.public_key.to_base64());
        out
    }

    /// Peer lines for the userspace API
    ///
    /// `public_key=` must come first since it starts a new peer. Resolving
    /// the endpoint may block on DNS; an endpoint that does not resolve is
    /// left out so the rest of the peer still applies.
    pub fn to_wg_userspace_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "public_key={}", self.public_key.to_hex());
        let _ = writeln!(out, "replace_allowed_ips=true");
        for allowed_ip in &self.allowed_ips {
            let _ = writeln!(out, "allowed_ip={}", allowed_ip);
        }
        if let Some(endpoint) = &self.endpoint {
            match endpoint.resolve() {
                Some(address) => {
                    let _ = writeln!(out, "endpoint={}", address);
                }
                None => log::warn!("Skipping unresolved endpoint {}", endpoint),
            }
        }
        if let Some(seconds) = self.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={}", seconds);
        }
        if let Some(psk) = &self.pre_shared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PSK: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

    fn parse(text: &str) -> Result<Peer, BadConfigError> {
        Peer::parse(text.lines())
    }

    #[test]
    fn test_parse_peer() {
        let peer = parse(&format!(
            "PublicKey = {}\n\
             PresharedKey = {}\n\
             AllowedIPs = 0.0.0.0/0, ::/0\n\
             Endpoint = 192.0.2.1:51820\n\
             PersistentKeepalive = 25",
            PUBLIC_KEY, PSK
        ))
        .unwrap();

        assert_eq!(peer.public_key.to_base64(), PUBLIC_KEY);
        assert_eq!(peer.pre_shared_key.unwrap().to_base64(), PSK);
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.endpoint.as_ref().unwrap().port(), 51820);
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn test_missing_public_key() {
        let err = parse("AllowedIPs = 10.0.0.0/8").unwrap_err();
        assert_eq!(err.section(), Section::Peer);
        assert_eq!(err.location(), Location::PublicKey);
        assert_eq!(err.reason(), Reason::MissingAttribute);
    }

    #[test]
    fn test_invalid_public_key() {
        let err = parse("PublicKey = AAAA").unwrap_err();
        assert_eq!(err.location(), Location::PublicKey);
        assert_eq!(err.reason(), Reason::InvalidKey);
    }

    #[test]
    fn test_keepalive_range() {
        let ok = format!("PublicKey = {}\nPersistentKeepalive = 65535", PUBLIC_KEY);
        assert_eq!(parse(&ok).unwrap().persistent_keepalive, Some(65535));

        let err = parse(&format!("PublicKey = {}\nPersistentKeepalive = 65536", PUBLIC_KEY))
            .unwrap_err();
        assert_eq!(err.location(), Location::PersistentKeepalive);
        assert_eq!(err.reason(), Reason::InvalidValue);

        let err = parse(&format!("PublicKey = {}\nPersistentKeepalive = -1", PUBLIC_KEY))
            .unwrap_err();
        assert_eq!(err.reason(), Reason::InvalidValue);

        let off = parse(&format!("PublicKey = {}\nPersistentKeepalive = 0", PUBLIC_KEY)).unwrap();
        assert_eq!(off.persistent_keepalive, None);
    }

    #[test]
    fn test_bad_endpoint() {
        let err = parse(&format!("PublicKey = {}\nEndpoint = nope", PUBLIC_KEY)).unwrap_err();
        assert_eq!(err.location(), Location::Endpoint);
        assert_eq!(err.reason(), Reason::InvalidValue);
    }

    #[test]
    fn test_unknown_attribute() {
        let err = parse(&format!("PublicKey = {}\nFoo = bar", PUBLIC_KEY)).unwrap_err();
        assert_eq!(err.section(), Section::Peer);
        assert_eq!(err.location(), Location::TopLevel);
        assert_eq!(err.reason(), Reason::UnknownAttribute);
    }

    #[test]
    fn test_userspace_string_starts_with_public_key() {
        let peer = parse(&format!(
            "PublicKey = {}\nAllowedIPs = 10.0.0.0/8\nEndpoint = 192.0.2.1:51820\nPersistentKeepalive = 25\nPreSharedKey = {}",
            PUBLIC_KEY, PSK
        ))
        .unwrap();
        let text = peer.to_wg_userspace_string();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            format!("public_key={}", Key::from_base64(PUBLIC_KEY).unwrap().to_hex())
        );
        assert!(lines.contains(&"allowed_ip=10.0.0.0/8"));
        assert!(lines.contains(&"endpoint=192.0.2.1:51820"));
        assert!(lines.contains(&"persistent_keepalive_interval=25"));
        assert!(text.contains(&format!("preshared_key={}", Key::from_base64(PSK).unwrap().to_hex())));
    }

    #[test]
    fn test_wg_quick_string_omits_unset() {
        let peer = Peer::new(Key::from_base64(PUBLIC_KEY).unwrap());
        assert_eq!(peer.to_wg_quick_string(), format!("PublicKey = {}\n", PUBLIC_KEY));
    }
}
