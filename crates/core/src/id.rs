//! Compact destination identifiers.
//!
//! A destination is addressed by a signed numeric id plus a small type tag
//! (user, group, channel, ...). Both are packed into a single `u64` so keys are
//! `Copy`, hash cheaply and can be stored inline in cleanup rules.
//!
//! ## Layout
//!
//! ```text
//!  63   62 ........................ 11  10 .. 7  6 ...... 0
//! [sign][        52-bit magnitude      ][ type  ][reserved ]
//! ```
//!
//! Reserved bits are always zero.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const SIGN_BIT: u64 = 1 << 63;
const ID_SHIFT: u32 = 11;
const TYPE_SHIFT: u32 = 7;
const TYPE_MASK: u64 = 0xF;
const RESERVED_MASK: u64 = (1 << TYPE_SHIFT) - 1;

/// Largest destination id magnitude that fits the packed layout.
pub const MAX_DESTINATION_ID: i64 = (1 << 52) - 1;

/// Destination type tag (`0..16`).
///
/// Each type carries its own rate-limit budget in the pipeline configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DestinationType(u8);

impl DestinationType {
    /// Number of distinct destination types.
    pub const COUNT: usize = 16;

    /// One-to-one conversation with a user.
    pub const USER: Self = Self(0);
    /// Multi-member group chat.
    pub const GROUP: Self = Self(1);
    /// Broadcast channel.
    pub const CHANNEL: Self = Self(2);

    pub fn new(tag: u8) -> Result<Self, CoreError> {
        if (tag as usize) < Self::COUNT {
            Ok(Self(tag))
        } else {
            Err(CoreError::invalid_id(format!(
                "destination type {tag} out of range 0..{}",
                Self::COUNT
            )))
        }
    }

    pub fn tag(self) -> u8 {
        self.0
    }

    /// Index into per-type tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u8> for DestinationType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DestinationType> for u8 {
    fn from(value: DestinationType) -> Self {
        value.0
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::USER => f.write_str("user"),
            Self::GROUP => f.write_str("group"),
            Self::CHANNEL => f.write_str("channel"),
            Self(other) => write!(f, "type{other}"),
        }
    }
}

/// Packed `(id, type)` destination key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct DestinationKey(u64);

impl DestinationKey {
    /// Pack an id and a type into a key.
    ///
    /// Fails when `|id|` exceeds [`MAX_DESTINATION_ID`].
    pub fn new(id: i64, kind: DestinationType) -> Result<Self, CoreError> {
        let magnitude = id.unsigned_abs();
        if magnitude > MAX_DESTINATION_ID as u64 {
            return Err(CoreError::invalid_id(format!(
                "destination id {id} does not fit in 52 bits"
            )));
        }

        let sign = if id < 0 { SIGN_BIT } else { 0 };
        Ok(Self(sign | (magnitude << ID_SHIFT) | ((kind.0 as u64) << TYPE_SHIFT)))
    }

    /// Shorthand for a user-type destination.
    pub fn user(id: i64) -> Result<Self, CoreError> {
        Self::new(id, DestinationType::USER)
    }

    /// Shorthand for a group-type destination.
    pub fn group(id: i64) -> Result<Self, CoreError> {
        Self::new(id, DestinationType::GROUP)
    }

    /// Shorthand for a channel-type destination.
    pub fn channel(id: i64) -> Result<Self, CoreError> {
        Self::new(id, DestinationType::CHANNEL)
    }

    /// Rebuild a key from its packed form, rejecting non-zero reserved bits.
    pub fn from_raw(raw: u64) -> Result<Self, CoreError> {
        if raw & RESERVED_MASK != 0 {
            return Err(CoreError::invalid_id(format!(
                "destination key {raw:#x} has reserved bits set"
            )));
        }
        if raw == SIGN_BIT {
            return Err(CoreError::invalid_id("destination key encodes negative zero"));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn id(self) -> i64 {
        let magnitude = ((self.0 & !SIGN_BIT) >> ID_SHIFT) as i64;
        if self.0 & SIGN_BIT != 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn kind(self) -> DestinationType {
        DestinationType(((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }
}

impl TryFrom<u64> for DestinationKey {
    type Error = CoreError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl From<DestinationKey> for u64 {
    fn from(value: DestinationKey) -> Self {
        value.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl fmt::Debug for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DestinationKey({self})")
    }
}

/// Parses `"<type>:<id>"` where `<type>` is `user`, `group`, `channel` or a
/// numeric tag.
impl FromStr for DestinationKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| CoreError::invalid_id(format!("DestinationKey: missing ':' in {s:?}")))?;

        let kind = match kind {
            "user" => DestinationType::USER,
            "group" => DestinationType::GROUP,
            "channel" => DestinationType::CHANNEL,
            other => {
                let tag = other
                    .strip_prefix("type")
                    .unwrap_or(other)
                    .parse::<u8>()
                    .map_err(|e| CoreError::invalid_id(format!("DestinationKey: {e}")))?;
                DestinationType::new(tag)?
            }
        };
        let id = id
            .parse::<i64>()
            .map_err(|e| CoreError::invalid_id(format!("DestinationKey: {e}")))?;

        Self::new(id, kind)
    }
}
