//! Discovery records and XID slot arithmetic.
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Error, Result};
use rand::Rng;

/// Slot marker of the final XID command of a discovery.
pub const FINAL_SLOT: u8 = 0xff;

const XIDEXTRA_TIMEOUT: Duration = Duration::from_millis(34);
const SMALLBUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// What a device tells others about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Discovery {
    /// Address of the discovered device.
    pub daddr: u32,
    /// Our address, as seen by it.
    pub saddr: u32,
    pub hints: [u8; 2],
    pub charset: u8,
    pub nickname: String,
}

impl Discovery {
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(3 + self.nickname.len());
        ret.extend(self.hints);
        ret.push(self.charset);
        ret.extend(self.nickname.as_bytes());
        ret
    }

    /// Parse the discovery info tail of an XID frame. Addresses come from the
    /// XID header.
    pub fn parse(bytes: &[u8], daddr: u32, saddr: u32) -> Result<Self> {
        if bytes.len() < 3 {
            return Err(Error::msg(format!(
                "discovery info too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            daddr,
            saddr,
            hints: [bytes[0], bytes[1]],
            charset: bytes[2],
            nickname: String::from_utf8_lossy(&bytes[3..]).into_owned(),
        })
    }
}

/// Devices found during one discovery, keyed by their address.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DiscoveryLog {
    entries: BTreeMap<u32, Discovery>,
}

impl DiscoveryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any earlier answer from the same device.
    pub fn insert(&mut self, d: Discovery) {
        self.entries.insert(d.daddr, d);
    }

    #[must_use]
    pub fn get(&self, daddr: u32) -> Option<&Discovery> {
        self.entries.get(&daddr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Discovery> {
        self.entries.values()
    }
}

/// Slot count carried in the XID flags field.
pub fn slot_count_to_flags(slots: u8) -> Result<u8> {
    Ok(match slots {
        1 => 0,
        6 => 1,
        8 => 2,
        16 => 3,
        n => return Err(Error::msg(format!("invalid number of discovery slots: {n}"))),
    })
}

#[must_use]
pub fn flags_to_slot_count(flags: u8) -> u8 {
    match flags & 0x03 {
        0 => 1,
        1 => 6,
        2 => 8,
        _ => 16,
    }
}

/// Pick the slot to answer in, uniformly in `[s, slots)`.
pub fn random_slot<R: Rng + ?Sized>(slots: u8, s: u8, rng: &mut R) -> u8 {
    if s.saturating_add(1) >= slots {
        return s;
    }
    rng.gen_range(s..slots)
}

/// How long to stay in REPLY after seeing slot `s` of `slots`.
///
/// The end-of-discovery frame normally ends it sooner.
#[must_use]
pub fn query_timeout(slots: u8, s: u8, slot_timeout: Duration) -> Duration {
    slot_timeout * u32::from(slots.saturating_sub(s)) + XIDEXTRA_TIMEOUT + SMALLBUSY_TIMEOUT
}
