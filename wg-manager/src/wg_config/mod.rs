// wg-quick configuration model

//! Parser and serializer for wg-quick configuration files
//!
//! A [`Config`] is one [`Interface`] plus any number of [`Peer`]s. Parsing is
//! strict: every problem is reported as a [`BadConfigError`] naming the
//! section, the attribute and a [`Reason`]. Several `[Interface]` sections in
//! one file are merged; peers keep their file order.
//!
//! [`Config::to_wg_quick_string`] produces the text stored on disk and handed
//! to `wg-quick`. [`Config::to_wg_userspace_string`] produces the `key=value`
//! form spoken on a userspace WireGuard control socket.

mod attribute;
mod error;
mod inet;
mod interface;
mod peer;

pub use error::{BadConfigError, Location, Reason, Section, ValueError};
pub use inet::{parse_address, parse_network, InetEndpoint};
pub use interface::Interface;
pub use peer::Peer;

use anyhow::{Context, Result};
use attribute::strip_comment;
use std::io::BufRead;
use std::str::FromStr;

/// A complete tunnel configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub interface: Interface,
    pub peers: Vec<Peer>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Current {
    Nothing,
    Interface,
    Peer,
}

impl Config {
    /// Parse the text of a wg-quick file
    pub fn parse(text: &str) -> Result<Self, BadConfigError> {
        let mut interface_lines = Vec::new();
        let mut peer_lines: Option<Vec<&str>> = None;
        let mut peers = Vec::new();
        let mut seen_interface = false;
        let mut current = Current::Nothing;

        for raw in text.lines() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                if let Some(lines) = peer_lines.take() {
                    peers.push(Peer::parse(lines)?);
                }
                if line.eq_ignore_ascii_case("[Interface]") {
                    current = Current::Interface;
                    seen_interface = true;
                } else if line.eq_ignore_ascii_case("[Peer]") {
                    current = Current::Peer;
                    peer_lines = Some(Vec::new());
                } else {
                    return Err(BadConfigError::new(
                        Section::Config,
                        Location::TopLevel,
                        Reason::UnknownSection,
                        Some(line),
                    ));
                }
                continue;
            }

            match (current, peer_lines.as_mut()) {
                (Current::Interface, _) => interface_lines.push(line),
                (Current::Peer, Some(lines)) => lines.push(line),
                _ => {
                    return Err(BadConfigError::new(
                        Section::Config,
                        Location::TopLevel,
                        Reason::UnknownSection,
                        Some(line),
                    ))
                }
            }
        }

        if let Some(lines) = peer_lines.take() {
            peers.push(Peer::parse(lines)?);
        }
        if !seen_interface {
            return Err(BadConfigError::new(
                Section::Config,
                Location::TopLevel,
                Reason::MissingSection,
                None,
            ));
        }

        Ok(Self {
            interface: Interface::parse(interface_lines)?,
            peers,
        })
    }

    /// Read and parse a wg-quick file from a stream
    ///
    /// A parse failure keeps the [`BadConfigError`] as the root cause so it
    /// can be recovered with `downcast_ref`.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .context("Failed to read configuration")?;
        Ok(Self::parse(&text)?)
    }

    /// Canonical wg-quick text
    pub fn to_wg_quick_string(&self) -> String {
        let mut out = String::from("[Interface]\n");
        out.push_str(&self.interface.to_wg_quick_string());
        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            out.push_str(&peer.to_wg_quick_string());
        }
        out
    }

    /// Full device configuration for a userspace `set=1` request
    ///
    /// Replaces any peers the device already has. Blocks while peer endpoint
    /// names are resolved.
    pub fn to_wg_userspace_string(&self) -> String {
        let mut out = self.interface.to_wg_userspace_string();
        out.push_str("replace_peers=true\n");
        for peer in &self.peers {
            out.push_str(&peer.to_wg_userspace_string());
        }
        out
    }
}

impl FromStr for Config {
    type Err = BadConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse an integer attribute and check it against an inclusive range
fn parse_number(
    section: Section,
    location: Location,
    value: &str,
    min: i64,
    max: i64,
) -> Result<i64, BadConfigError> {
    let number: i64 = value.parse().map_err(|_| {
        BadConfigError::from_value(section, location, value, ValueError::Number(value.to_string()))
    })?;
    if number < min || number > max {
        return Err(BadConfigError::from_value(
            section,
            location,
            value,
            ValueError::Range {
                value: number,
                min,
                max,
            },
        ));
    }
    Ok(number)
}

/// Append unless already present, keeping first-seen order
fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}
