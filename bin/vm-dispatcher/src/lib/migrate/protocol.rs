// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functions for dealing with protocol negotiation.
//!
//! Protocols are identified by strings of the form
//! "vmdisp-migrate-encoding/version". When a source dispatcher connects, it
//! sends the list of protocols it is willing to speak as the first (text)
//! frame of the session. The target picks the newest protocol it also
//! supports and echoes it back. The chosen version then gates which optional
//! command fields either side may emit for the rest of the session.

use std::{fmt::Display, iter::Peekable, num::ParseIntError, str::FromStr};

use lazy_static::lazy_static;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

/// Revisions of the dispatcher-to-dispatcher command set.
///
/// Each revision only ever adds optional fields; see the `restrict` helpers
/// in `commands` for which fields each one introduced.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumIter,
    Eq,
    Hash,
    IntoPrimitive,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    TryFromPrimitive,
)]
#[repr(u32)]
pub enum ProtocolVersion {
    /// Oldest revision still accepted: snapshot ids.
    V2 = 2,
    /// Previous VM state, reserved flags, permission bits, hot migration.
    V3 = 3,
    /// Multiple probe files and the non-shared external disk list.
    V4 = 4,
}

impl ProtocolVersion {
    pub const MIN_SUPPORTED: ProtocolVersion = ProtocolVersion::V2;
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V4;

    pub fn as_u32(self) -> u32 {
        self.into()
    }

    /// Returns the newest version not above `ceiling`, or `None` if the
    /// ceiling is below every supported version.
    pub fn clamp_to(ceiling: Option<u32>) -> Option<ProtocolVersion> {
        match ceiling {
            None => Some(ProtocolVersion::CURRENT),
            Some(max) => {
                ProtocolVersion::iter().filter(|v| v.as_u32() <= max).max()
            }
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// The complete set of protocols supported by this dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Protocol {
    RonV2,
    RonV3,
    RonV4,
}

impl Protocol {
    /// Yields the offer string for this protocol variant.
    pub fn offer_string(&self) -> String {
        ProtocolParts::from(*self).offer_string()
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Protocol::RonV2 => ProtocolVersion::V2,
            Protocol::RonV3 => ProtocolVersion::V3,
            Protocol::RonV4 => ProtocolVersion::V4,
        }
    }
}

impl TryFrom<ProtocolParts> for Protocol {
    type Error = ProtocolParseError;

    fn try_from(value: ProtocolParts) -> Result<Self, Self::Error> {
        let ProtocolParts { encoding: Encoding::Ron, version } = value;
        match ProtocolVersion::try_from(version) {
            Ok(ProtocolVersion::V2) => Ok(Protocol::RonV2),
            Ok(ProtocolVersion::V3) => Ok(Protocol::RonV3),
            Ok(ProtocolVersion::V4) => Ok(Protocol::RonV4),
            Err(_) => Err(ProtocolParseError::UnsupportedProtocol(
                value.offer_string(),
            )),
        }
    }
}

// Offers are comma-delimited lists of "vmdisp-migrate-encoding/version".

const PREFIX: &str = "vmdisp-migrate-";

const ENCODING_VERSION_SEPARATOR: char = '/';

const DELIMITER: char = ',';

/// Errors that can arise while parsing a protocol offer string.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum ProtocolParseError {
    #[error("protocol string did not begin with vmdisp-migrate: {0}")]
    InvalidPrefix(String),

    #[error("protocol string did not have a '/' separator: {0}")]
    NoEncodingVersionSeparator(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("failed to parse protocol version number {0}: {1}")]
    InvalidVersionNumber(String, String),

    #[error("offered protocol set contained duplicate protocol {0}")]
    DuplicateProtocolInOffer(String),

    #[error("protocol {0} is not supported by this dispatcher")]
    UnsupportedProtocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Encoding {
    /// Rust Object Notation.
    Ron,
}

impl Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encoding::Ron => write!(f, "ron"),
        }
    }
}

impl FromStr for Encoding {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ron" => Ok(Encoding::Ron),
            _ => Err(ProtocolParseError::InvalidEncoding(s.to_owned())),
        }
    }
}

// N.B. Field order matters: the derived Ord compares versions before
//      encodings so negotiation always prefers the newest version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ProtocolParts {
    version: u32,
    encoding: Encoding,
}

impl ProtocolParts {
    fn offer_string(&self) -> String {
        format!(
            "{}{}{}{}",
            PREFIX, self.encoding, ENCODING_VERSION_SEPARATOR, self.version
        )
    }
}

impl From<Protocol> for ProtocolParts {
    fn from(value: Protocol) -> Self {
        ProtocolParts {
            version: value.version().as_u32(),
            encoding: Encoding::Ron,
        }
    }
}

impl FromStr for ProtocolParts {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (encoding, version) = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ProtocolParseError::InvalidPrefix(s.to_owned()))?
            .split_once(ENCODING_VERSION_SEPARATOR)
            .ok_or_else(|| {
                ProtocolParseError::NoEncodingVersionSeparator(s.to_owned())
            })?;

        let encoding = Encoding::from_str(encoding)?;
        let version = version.parse().map_err(|e: ParseIntError| {
            ProtocolParseError::InvalidVersionNumber(
                version.to_owned(),
                e.to_string(),
            )
        })?;

        Ok(ProtocolParts { encoding, version })
    }
}

lazy_static! {
    static ref PROTOCOL_PARTS: Vec<ProtocolParts> =
        Protocol::iter().map(ProtocolParts::from).collect();
}

fn make_protocol_offers_from_parts<
    T: std::iter::Iterator<Item = ProtocolParts>,
>(
    mut iter: Peekable<T>,
) -> String {
    let mut s = String::new();
    while let Some(p) = iter.next() {
        s.push_str(&p.offer_string());
        if iter.peek().is_some() {
            s.push(DELIMITER);
        }
    }

    s
}

/// Builds the offer string for every supported protocol whose version does
/// not exceed `ceiling`.
pub(crate) fn make_protocol_offer(ceiling: Option<u32>) -> String {
    make_protocol_offers_from_parts(
        supported_parts(ceiling).into_iter().peekable(),
    )
}

fn supported_parts(ceiling: Option<u32>) -> Vec<ProtocolParts> {
    PROTOCOL_PARTS
        .iter()
        .filter(|p| ceiling.map_or(true, |max| p.version <= max))
        .copied()
        .collect()
}

fn parse_protocol_offer(
    offer: &str,
) -> Result<Vec<ProtocolParts>, ProtocolParseError> {
    let mut parsed = Vec::new();
    for o in offer.split(DELIMITER) {
        let protocol: ProtocolParts = o.trim().parse()?;
        if parsed.contains(&protocol) {
            return Err(ProtocolParseError::DuplicateProtocolInOffer(
                protocol.offer_string(),
            ));
        }

        parsed.push(protocol);
    }

    parsed.sort_unstable();
    Ok(parsed)
}

/// Selects the newest protocol in `offered` that also appears in `supported`.
/// `offered` must be sorted ascending.
fn select_compatible_protocol(
    offered: &[ProtocolParts],
    supported: &[ProtocolParts],
) -> Option<ProtocolParts> {
    debug_assert!(offered.windows(2).all(|pair| pair[0] <= pair[1]));

    offered.iter().rev().find(|o| supported.contains(o)).copied()
}

/// Given an incoming protocol offer string, selects a compatible protocol to
/// use.
///
/// Returns `Ok(None)` if the offer parsed but held nothing this dispatcher
/// (capped at `ceiling`) can speak.
pub(crate) fn select_protocol_from_offer(
    offer: &str,
    ceiling: Option<u32>,
) -> Result<Option<Protocol>, ProtocolParseError> {
    let offered = parse_protocol_offer(offer)?;
    select_compatible_protocol(&offered, &supported_parts(ceiling))
        .map(Protocol::try_from)
        .transpose()
}

/// Parses the target's echo of the selected protocol and checks that it was
/// one of the ones offered.
pub(crate) fn parse_selected_protocol(
    selected: &str,
    ceiling: Option<u32>,
) -> Result<Protocol, ProtocolParseError> {
    let parts: ProtocolParts = selected.trim().parse()?;
    if !supported_parts(ceiling).contains(&parts) {
        return Err(ProtocolParseError::UnsupportedProtocol(
            selected.to_owned(),
        ));
    }
    Protocol::try_from(parts)
}
