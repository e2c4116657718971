//! The `[Interface]` section

use super::attribute::{join_list, split_list, Attribute};
use super::error::{BadConfigError, Location, Reason, Section};
use super::inet::{parse_address, parse_network};
use super::{parse_number, push_unique};
use crate::keys::{Key, KeyPair};
use ipnet::IpNet;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Local side of a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    /// Addresses assigned to the tunnel interface
    pub addresses: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    /// Applications to route outside the tunnel, kept in file order
    pub excluded_applications: Vec<String>,
    pub key_pair: Option<KeyPair>,
    /// `None` means an ephemeral port
    pub listen_port: Option<u16>,
    /// `None` means the backend default
    pub mtu: Option<u16>,
}

impl Interface {
    /// Build the interface from the attribute lines of every `[Interface]` section
    pub fn parse<'a, I>(lines: I) -> Result<Self, BadConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut interface = Interface::default();
        let mut recognized = 0usize;

        for line in lines {
            let attribute = Attribute::parse(line).ok_or_else(|| {
                BadConfigError::new(
                    Section::Interface,
                    Location::TopLevel,
                    Reason::SyntaxError,
                    Some(line),
                )
            })?;
            interface.apply(&attribute)?;
            recognized += 1;
        }

        if recognized == 0 {
            return Err(BadConfigError::new(
                Section::Interface,
                Location::TopLevel,
                Reason::MissingAttribute,
                None,
            ));
        }
        Ok(interface)
    }

    fn apply(&mut self, attribute: &Attribute<'_>) -> Result<(), BadConfigError> {
        let location = match attribute.lower_key().as_str() {
            "address" => Location::Address,
            "dns" => Location::Dns,
            "excludedapplications" => Location::ExcludedApplications,
            "listenport" => Location::ListenPort,
            "mtu" => Location::Mtu,
            "privatekey" => Location::PrivateKey,
            _ => {
                return Err(BadConfigError::new(
                    Section::Interface,
                    Location::TopLevel,
                    Reason::UnknownAttribute,
                    Some(attribute.key),
                ))
            }
        };

        let value = attribute.value;
        if value.is_empty() {
            return Err(BadConfigError::new(
                Section::Interface,
                location,
                Reason::MissingValue,
                None,
            ));
        }
        let bad = |cause| BadConfigError::from_value(Section::Interface, location, value, cause);

        match location {
            Location::Address => {
                for item in split_list(value) {
                    push_unique(&mut self.addresses, parse_network(item).map_err(bad)?);
                }
            }
            Location::Dns => {
                for item in split_list(value) {
                    push_unique(&mut self.dns_servers, parse_address(item).map_err(bad)?);
                }
            }
            Location::ExcludedApplications => {
                for item in split_list(value) {
                    push_unique(&mut self.excluded_applications, item.to_string());
                }
            }
            Location::ListenPort => {
                let port = parse_number(Section::Interface, location, value, 0, 65535)?;
                self.listen_port = non_zero(port);
            }
            Location::Mtu => {
                let mtu = parse_number(Section::Interface, location, value, 0, 65535)?;
                self.mtu = non_zero(mtu);
            }
            Location::PrivateKey => {
                let key = Key::from_base64(value).map_err(|e| bad(e.into()))?;
                self.key_pair = Some(KeyPair::new(key));
            }
            _ => {}
        }
        Ok(())
    }

    /// Public key derived from the private key, if there is one
    pub fn public_key(&self) -> Option<&Key> {
        self.key_pair.as_ref().map(KeyPair::public_key)
    }

    /// `Key = Value` lines for a wg-quick file, without the section header
    pub fn to_wg_quick_string(&self) -> String {
        let mut out = String::new();
        if !self.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", join_list(&self.addresses));
        }
        if !self.dns_servers.is_empty() {
            let _ = writeln!(out, "DNS = {}", join_list(&self.dns_servers));
        }
        if !self.excluded_applications.is_empty() {
            let _ = writeln!(
                out,
                "ExcludedApplications = {}",
                join_list(&self.excluded_applications)
            );
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if let Some(mtu) = self.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }
        if let Some(pair) = &self.key_pair {
            let _ = writeln!(out, "PrivateKey = {}", pair.private_key().to_base64());
        }
        out
    }

    /// Device-level `key=value` lines for the userspace API
    ///
    /// Addresses, DNS and MTU are not part of the protocol; the backend
    /// applies them to the link itself.
    pub fn to_wg_userspace_string(&self) -> String {
        let mut out = String::new();
        if let Some(pair) = &self.key_pair {
            let _ = writeln!(out, "private_key={}", pair.private_key().to_hex());
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "listen_port={}", port);
        }
        out
    }
}

fn non_zero(value: i64) -> Option<u16> {
    match u16::try_from(value) {
        Ok(0) | Err(_) => None,
        Ok(value) => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    fn parse(text: &str) -> Result<Interface, BadConfigError> {
        Interface::parse(text.lines())
    }

    #[test]
    fn test_parse_all_attributes() {
        let iface = parse(&format!(
            "Address = 10.0.0.2/24, fd00::2/64\n\
             DNS = 1.1.1.1, 2606:4700:4700::1111\n\
             ExcludedApplications = org.example.app, org.example.other\n\
             ListenPort = 51820\n\
             MTU = 1420\n\
             PrivateKey = {}",
            PRIVATE_KEY
        ))
        .unwrap();

        assert_eq!(iface.addresses.len(), 2);
        assert_eq!(iface.dns_servers.len(), 2);
        assert_eq!(
            iface.excluded_applications,
            vec!["org.example.app", "org.example.other"]
        );
        assert_eq!(iface.listen_port, Some(51820));
        assert_eq!(iface.mtu, Some(1420));
        assert_eq!(
            iface.key_pair.as_ref().unwrap().private_key().to_base64(),
            PRIVATE_KEY
        );
        assert!(iface.public_key().is_some());
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let iface = parse("address = 10.0.0.2/32\nmtu = 1280").unwrap();
        assert_eq!(iface.mtu, Some(1280));
        assert_eq!(iface.addresses.len(), 1);
    }

    #[test]
    fn test_duplicate_values_collapse() {
        let iface = parse("Address = 10.0.0.2/32, 10.0.0.2/32\nAddress = 10.0.0.2/32").unwrap();
        assert_eq!(iface.addresses.len(), 1);
    }

    #[test]
    fn test_zero_means_unset() {
        let iface = parse("ListenPort = 0\nMTU = 0").unwrap();
        assert_eq!(iface.listen_port, None);
        assert_eq!(iface.mtu, None);
        assert!(!iface.to_wg_quick_string().contains("= 0"));
    }

    #[test]
    fn test_number_errors() {
        let err = parse("ListenPort = abc").unwrap_err();
        assert_eq!(err.section(), Section::Interface);
        assert_eq!(err.location(), Location::ListenPort);
        assert_eq!(err.reason(), Reason::InvalidNumber);

        let err = parse("ListenPort = 65536").unwrap_err();
        assert_eq!(err.reason(), Reason::InvalidValue);

        let err = parse("MTU = -1").unwrap_err();
        assert_eq!(err.location(), Location::Mtu);
        assert_eq!(err.reason(), Reason::InvalidValue);
    }

    #[test]
    fn test_invalid_private_key() {
        let err = parse("PrivateKey = notakey").unwrap_err();
        assert_eq!(err.location(), Location::PrivateKey);
        assert_eq!(err.reason(), Reason::InvalidKey);
    }

    #[test]
    fn test_dns_rejects_names() {
        let err = parse("DNS = dns.example.com").unwrap_err();
        assert_eq!(err.location(), Location::Dns);
        assert_eq!(err.reason(), Reason::InvalidValue);
    }

    #[test]
    fn test_unknown_attribute() {
        let err = parse("Table = off").unwrap_err();
        assert_eq!(err.section(), Section::Interface);
        assert_eq!(err.location(), Location::TopLevel);
        assert_eq!(err.reason(), Reason::UnknownAttribute);
        assert_eq!(err.text(), Some("Table"));
    }

    #[test]
    fn test_missing_value_and_syntax() {
        let err = parse("MTU =").unwrap_err();
        assert_eq!(err.location(), Location::Mtu);
        assert_eq!(err.reason(), Reason::MissingValue);

        let err = parse("this is not an attribute").unwrap_err();
        assert_eq!(err.reason(), Reason::SyntaxError);
    }

    #[test]
    fn test_empty_section() {
        let err = parse("").unwrap_err();
        assert_eq!(err.section(), Section::Interface);
        assert_eq!(err.reason(), Reason::MissingAttribute);
    }

    #[test]
    fn test_userspace_string() {
        let iface = parse(&format!("PrivateKey = {}\nListenPort = 51820\nMTU = 1420", PRIVATE_KEY))
            .unwrap();
        let key = Key::from_base64(PRIVATE_KEY).unwrap();
        assert_eq!(
            iface.to_wg_userspace_string(),
            format!("private_key={}\nlisten_port=51820\n", key.to_hex())
        );
    }
}
