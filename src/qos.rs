//! Quality of service parameters.
//!
//! Peers advertise what they support as bitfields in SNRM and UA frames. The
//! state machine only consumes the negotiated result; this module holds the
//! value tables, the parameter list codec and the negotiation rule.
use anyhow::{Error, Result};

pub const PI_BAUD_RATE: u8 = 0x01;
pub const PI_MAX_TURN_TIME: u8 = 0x82;
pub const PI_DATA_SIZE: u8 = 0x83;
pub const PI_WINDOW_SIZE: u8 = 0x84;
pub const PI_ADD_BOFS: u8 = 0x85;
pub const PI_MIN_TURN_TIME: u8 = 0x86;
pub const PI_LINK_DISC: u8 = 0x08;

// Index is bit number in the advertised field.
const BAUD_RATES: [u32; 10] = [
    2400, 9600, 19200, 38400, 57600, 115200, 576000, 1152000, 4000000, 16000000,
];
const MAX_TURN_TIMES: [u32; 4] = [500, 250, 100, 50]; // ms
const DATA_SIZES: [usize; 6] = [64, 128, 256, 512, 1024, 2048];
const WINDOW_SIZES: [u8; 7] = [1, 2, 3, 4, 5, 6, 7];
const ADD_BOFS: [u32; 8] = [48, 24, 12, 5, 3, 2, 1, 0];
const MIN_TURN_TIMES: [u32; 8] = [10000, 5000, 1000, 500, 100, 50, 10, 0]; // us
const LINK_DISC_TIMES: [u32; 8] = [3, 8, 12, 16, 20, 25, 30, 40]; // s

// Bytes per turn, rows by baud rate, columns by max turn time.
const LINE_CAPACITIES: [[usize; 4]; 10] = [
    [100, 0, 0, 0],
    [400, 0, 0, 0],
    [800, 0, 0, 0],
    [1600, 0, 0, 0],
    [2360, 0, 0, 0],
    [4800, 2400, 960, 480],
    [28800, 11520, 5760, 2880],
    [57600, 28800, 11520, 5760],
    [200000, 100000, 40000, 20000],
    [2000000, 1000000, 400000, 200000],
];

/// Negotiated link parameters for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    pub baud_rate: u32,
    /// Milliseconds.
    pub max_turn_time: u32,
    pub data_size: usize,
    pub window_size: u8,
    pub additional_bofs: u32,
    /// Microseconds.
    pub min_turn_time: u32,
    /// Seconds.
    pub link_disc_time: u32,
}

impl Qos {
    /// Values used in NDM, before anything is negotiated.
    #[must_use]
    pub fn default_ndm() -> Self {
        Self {
            baud_rate: 9600,
            max_turn_time: 0,
            data_size: 64,
            window_size: 1,
            additional_bofs: 12,
            min_turn_time: 0,
            link_disc_time: 0,
        }
    }
}

impl Default for Qos {
    fn default() -> Self {
        Self::default_ndm()
    }
}

/// Advertised capabilities. Each field is a bitfield indexing the value
/// tables above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosCaps {
    pub baud_rate: u16,
    pub max_turn_time: u8,
    pub data_size: u8,
    pub window_size: u8,
    pub additional_bofs: u8,
    pub min_turn_time: u8,
    pub link_disc_time: u8,
}

impl Default for QosCaps {
    fn default() -> Self {
        Self {
            baud_rate: 0x003e, // 9600..115200
            max_turn_time: 0x01,
            data_size: 0x3f,
            window_size: 0x7f,
            additional_bofs: 0x04,
            min_turn_time: 0x07,
            link_disc_time: 0x07,
        }
    }
}

fn msb(bits: u16) -> Option<usize> {
    if bits == 0 {
        None
    } else {
        Some(15 - bits.leading_zeros() as usize)
    }
}

fn pick<T: Copy>(table: &[T], bits: u16, what: &str) -> Result<T> {
    let idx = msb(bits).ok_or_else(|| Error::msg(format!("empty QoS field: {what}")))?;
    table
        .get(idx)
        .copied()
        .ok_or_else(|| Error::msg(format!("QoS {what} bit {idx} out of range")))
}

impl QosCaps {
    /// Decode the highest advertised value of each field.
    pub fn values(&self) -> Result<Qos> {
        Ok(Qos {
            baud_rate: pick(&BAUD_RATES, self.baud_rate, "baud rate")?,
            max_turn_time: pick(&MAX_TURN_TIMES, self.max_turn_time.into(), "max turn time")?,
            data_size: pick(&DATA_SIZES, self.data_size.into(), "data size")?,
            window_size: pick(&WINDOW_SIZES, self.window_size.into(), "window size")?,
            additional_bofs: pick(&ADD_BOFS, self.additional_bofs.into(), "additional bofs")?,
            min_turn_time: pick(&MIN_TURN_TIMES, self.min_turn_time.into(), "min turn time")?,
            link_disc_time: pick(&LINK_DISC_TIMES, self.link_disc_time.into(), "link disc")?,
        })
    }

    /// Encode as a PI/PL/PV parameter list.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(22);
        ret.push(PI_BAUD_RATE);
        ret.push(2);
        ret.extend(self.baud_rate.to_le_bytes());
        for (pi, pv) in [
            (PI_MAX_TURN_TIME, self.max_turn_time),
            (PI_DATA_SIZE, self.data_size),
            (PI_WINDOW_SIZE, self.window_size),
            (PI_ADD_BOFS, self.additional_bofs),
            (PI_MIN_TURN_TIME, self.min_turn_time),
            (PI_LINK_DISC, self.link_disc_time),
        ] {
            ret.extend([pi, 1, pv]);
        }
        ret
    }

    /// Parse a parameter list. Parameters not present keep their
    /// lowest-common-denominator value; unknown PIs are skipped.
    pub fn parse(mut bytes: &[u8]) -> Result<Self> {
        let mut caps = Self {
            baud_rate: 0x0002,
            max_turn_time: 0x01,
            data_size: 0x01,
            window_size: 0x01,
            additional_bofs: 0x01,
            min_turn_time: 0x01,
            link_disc_time: 0x01,
        };
        while !bytes.is_empty() {
            if bytes.len() < 2 {
                return Err(Error::msg("truncated QoS parameter header"));
            }
            let (pi, pl) = (bytes[0], bytes[1] as usize);
            let pv = bytes
                .get(2..2 + pl)
                .ok_or_else(|| Error::msg(format!("truncated QoS parameter {pi:#x}")))?;
            let first = pv.first().copied().unwrap_or(0);
            match pi {
                PI_BAUD_RATE => {
                    caps.baud_rate = match pv {
                        [lo] => u16::from(*lo),
                        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                        [] => 0,
                    }
                }
                PI_MAX_TURN_TIME => caps.max_turn_time = first,
                PI_DATA_SIZE => caps.data_size = first,
                PI_WINDOW_SIZE => caps.window_size = first,
                PI_ADD_BOFS => caps.additional_bofs = first,
                PI_MIN_TURN_TIME => caps.min_turn_time = first,
                PI_LINK_DISC => caps.link_disc_time = first,
                _ => log::debug!("Skipping unknown QoS parameter {pi:#x}"),
            }
            bytes = &bytes[2 + pl..];
        }
        Ok(caps)
    }
}

/// Negotiate connection parameters.
///
/// Returns `(tx, rx)`. Baud rate and link disconnect time must be agreed on;
/// the rest apply per direction, so what we send is bounded by what the peer
/// says it can receive.
pub fn negotiate(ours: &QosCaps, peer: &QosCaps) -> Result<(Qos, Qos)> {
    let baud = ours.baud_rate & peer.baud_rate;
    if baud == 0 {
        return Err(Error::msg("no common baud rate"));
    }
    let disc = ours.link_disc_time & peer.link_disc_time;
    let disc = if disc == 0 { 0x01 } else { disc };
    let baud_rate = pick(&BAUD_RATES, baud, "baud rate")?;
    let link_disc_time = pick(&LINK_DISC_TIMES, disc.into(), "link disc")?;

    let mut tx = peer.values()?;
    let mut rx = ours.values()?;
    for q in [&mut tx, &mut rx] {
        q.baud_rate = baud_rate;
        q.link_disc_time = link_disc_time;
    }
    Ok((tx, rx))
}

/// How many bytes can be sent before the line must be turned around.
#[must_use]
pub fn line_capacity(baud_rate: u32, max_turn_time: u32) -> usize {
    let row = BAUD_RATES.iter().position(|&b| b == baud_rate);
    let col = MAX_TURN_TIMES.iter().position(|&t| t == max_turn_time);
    if let (Some(r), Some(c)) = (row, col) {
        let cap = LINE_CAPACITIES[r][c];
        if cap != 0 {
            return cap;
        }
    }
    // Bytes on the wire in max_turn_time, rounded down.
    (baud_rate as usize / 10) * max_turn_time as usize / 1000
}
