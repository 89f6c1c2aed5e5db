//! IrLAP, the IrDA link access protocol.
//!
//! This crate implements the link state machine: discovery, connection
//! setup, the primary and secondary data transfer cycles, and reset. Framing
//! (BOF/EOF, FCS) and the physical device are left to a [`Device`]
//! implementation, and the layer above gets its indications through
//! [`Upper`].
use anyhow::{Error, Result};

pub mod r#async;
pub mod discovery;
pub mod link;
pub mod qos;
pub mod state;
pub mod timer;

pub use discovery::{Discovery, DiscoveryLog};
pub use link::{Config, Link};
pub use qos::{Qos, QosCaps};

/// Broadcast connection address.
pub const CBROADCAST: u8 = 0xfe;
/// Broadcast device address.
pub const DEV_BROADCAST: u32 = 0xffff_ffff;

pub const CMD_FRAME: u8 = 0x01;
pub const PF_BIT: u8 = 0x10;

// Supervisory frames. Ending in 01.
pub const CONTROL_RR: u8 = 0x01;
pub const CONTROL_RNR: u8 = 0x05;
pub const CONTROL_REJ: u8 = 0x09;
pub const CONTROL_SREJ: u8 = 0x0d;

// Unnumbered frames. Ending in 11.
pub const CONTROL_SNRM: u8 = 0x83;
pub const CONTROL_DISC: u8 = 0x43; // RD when sent as response.
pub const CONTROL_UA: u8 = 0x63;
pub const CONTROL_DM: u8 = 0x0f;
pub const CONTROL_FRMR: u8 = 0x87;
pub const CONTROL_XID_CMD: u8 = 0x2f;
pub const CONTROL_XID_RSP: u8 = 0xaf;
pub const CONTROL_TEST: u8 = 0xe3;
pub const CONTROL_UI: u8 = 0x03;

pub const XID_FORMAT: u8 = 0x01;

const TYPE_MASK: u8 = 0x03;
const S_MASK: u8 = 0x0f;

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let b: [u8; 4] = bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::msg(format!("frame too short for address at {at}")))?;
    Ok(u32::from_le_bytes(b))
}

/// SNRM info field. Absent when the SNRM is used for a reset.
#[derive(Debug, Clone, PartialEq)]
pub struct SnrmInfo {
    pub saddr: u32,
    pub daddr: u32,
    /// Connection address the sender wants to use.
    pub ncaddr: u8,
    pub qos: QosCaps,
}

/// UA info field, present when answering a SNRM.
#[derive(Debug, Clone, PartialEq)]
pub struct UaInfo {
    pub saddr: u32,
    pub daddr: u32,
    pub qos: QosCaps,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snrm {
    pub poll: bool,
    pub info: Option<SnrmInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ua {
    pub poll: bool,
    pub info: Option<UaInfo>,
}

/// Supervisory frame body, shared by RR, RNR, REJ and SREJ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Supervisory {
    pub poll: bool,
    pub nr: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iframe {
    pub poll: bool,
    pub ns: u8,
    pub nr: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ui {
    pub poll: bool,
    pub payload: Vec<u8>,
}

/// Discovery exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Xid {
    pub saddr: u32,
    pub daddr: u32,
    /// Total number of slots, S.
    pub slots: u8,
    /// Current slot, s. `discovery::FINAL_SLOT` for the last command.
    pub slot: u8,
    pub version: u8,
    pub discovery: Option<Discovery>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub poll: bool,
    pub saddr: u32,
    pub daddr: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frmr {
    pub poll: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameType {
    Snrm(Snrm),
    Ua(Ua),
    Disc(bool),
    Rd(bool),
    Dm(bool),
    Rr(Supervisory),
    Rnr(Supervisory),
    Rej(Supervisory),
    Srej(Supervisory),
    Iframe(Iframe),
    Ui(Ui),
    Xid(Xid),
    Test(Test),
    Frmr(Frmr),
}

/// One de-framed IrLAP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Connection address, shifted left. Low bit always clear.
    pub caddr: u8,
    pub command: bool,
    pub frame_type: FrameType,
}

impl Frame {
    #[must_use]
    pub fn new(caddr: u8, command: bool, frame_type: FrameType) -> Self {
        Self {
            caddr: caddr & !CMD_FRAME,
            command,
            frame_type,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let pf = |p: bool| if p { PF_BIT } else { 0 };
        let sup = |code: u8, s: &Supervisory| code | pf(s.poll) | ((s.nr & 7) << 5);
        let mut ret = Vec::with_capacity(16);
        ret.push(self.caddr | if self.command { CMD_FRAME } else { 0 });
        match &self.frame_type {
            FrameType::Snrm(f) => {
                ret.push(CONTROL_SNRM | pf(f.poll));
                if let Some(info) = &f.info {
                    ret.extend(info.saddr.to_le_bytes());
                    ret.extend(info.daddr.to_le_bytes());
                    ret.push(info.ncaddr);
                    ret.extend(info.qos.serialize());
                }
            }
            FrameType::Ua(f) => {
                ret.push(CONTROL_UA | pf(f.poll));
                if let Some(info) = &f.info {
                    ret.extend(info.saddr.to_le_bytes());
                    ret.extend(info.daddr.to_le_bytes());
                    ret.extend(info.qos.serialize());
                }
            }
            FrameType::Disc(p) | FrameType::Rd(p) => ret.push(CONTROL_DISC | pf(*p)),
            FrameType::Dm(p) => ret.push(CONTROL_DM | pf(*p)),
            FrameType::Rr(s) => ret.push(sup(CONTROL_RR, s)),
            FrameType::Rnr(s) => ret.push(sup(CONTROL_RNR, s)),
            FrameType::Rej(s) => ret.push(sup(CONTROL_REJ, s)),
            FrameType::Srej(s) => ret.push(sup(CONTROL_SREJ, s)),
            FrameType::Iframe(f) => {
                ret.push(((f.nr & 7) << 5) | pf(f.poll) | ((f.ns & 7) << 1));
                ret.extend(&f.payload);
            }
            FrameType::Ui(f) => {
                ret.push(CONTROL_UI | pf(f.poll));
                ret.extend(&f.payload);
            }
            FrameType::Xid(x) => {
                let control = if self.command {
                    CONTROL_XID_CMD
                } else {
                    CONTROL_XID_RSP
                };
                ret.push(control | PF_BIT);
                ret.push(XID_FORMAT);
                ret.extend(x.saddr.to_le_bytes());
                ret.extend(x.daddr.to_le_bytes());
                // Slot counts are validated when the discovery is requested.
                ret.push(discovery::slot_count_to_flags(x.slots).unwrap_or(0));
                ret.push(x.slot);
                ret.push(x.version);
                if let Some(d) = &x.discovery {
                    ret.extend(d.serialize());
                }
            }
            FrameType::Test(t) => {
                ret.push(CONTROL_TEST | pf(t.poll));
                ret.extend(t.saddr.to_le_bytes());
                ret.extend(t.daddr.to_le_bytes());
                ret.extend(&t.payload);
            }
            FrameType::Frmr(f) => {
                ret.push(CONTROL_FRMR | pf(f.poll));
                ret.extend(&f.payload);
            }
        }
        ret
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::msg(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        let caddr = bytes[0] & !CMD_FRAME;
        let command = bytes[0] & CMD_FRAME != 0;
        let control = bytes[1];
        let info = &bytes[2..];
        let poll = control & PF_BIT != 0;
        let nr = (control >> 5) & 7;
        let frame_type = match control & TYPE_MASK {
            0 | 2 => FrameType::Iframe(Iframe {
                poll,
                ns: (control >> 1) & 7,
                nr,
                payload: info.to_vec(),
            }),
            1 => {
                let s = Supervisory { poll, nr };
                match control & S_MASK {
                    CONTROL_RR => FrameType::Rr(s),
                    CONTROL_RNR => FrameType::Rnr(s),
                    CONTROL_REJ => FrameType::Rej(s),
                    CONTROL_SREJ => FrameType::Srej(s),
                    _ => unreachable!("supervisory control {control:#x}"),
                }
            }
            _ => match control & !PF_BIT {
                CONTROL_SNRM if command => FrameType::Snrm(Snrm {
                    poll,
                    info: if info.is_empty() {
                        None
                    } else {
                        if info.len() < 9 {
                            return Err(Error::msg("SNRM info field too short"));
                        }
                        Some(SnrmInfo {
                            saddr: read_u32(info, 0)?,
                            daddr: read_u32(info, 4)?,
                            ncaddr: info[8] & !CMD_FRAME,
                            qos: QosCaps::parse(&info[9..])?,
                        })
                    },
                }),
                CONTROL_DISC if command => FrameType::Disc(poll),
                CONTROL_DISC => FrameType::Rd(poll),
                CONTROL_UA => FrameType::Ua(Ua {
                    poll,
                    info: if info.is_empty() {
                        None
                    } else {
                        Some(UaInfo {
                            saddr: read_u32(info, 0)?,
                            daddr: read_u32(info, 4)?,
                            qos: QosCaps::parse(&info[8..])?,
                        })
                    },
                }),
                CONTROL_DM => FrameType::Dm(poll),
                CONTROL_FRMR => FrameType::Frmr(Frmr {
                    poll,
                    payload: info.to_vec(),
                }),
                CONTROL_UI => FrameType::Ui(Ui {
                    poll,
                    payload: info.to_vec(),
                }),
                CONTROL_XID_CMD | CONTROL_XID_RSP => {
                    if info.len() < 12 {
                        return Err(Error::msg(format!("XID too short: {} bytes", info.len())));
                    }
                    if info[0] != XID_FORMAT {
                        return Err(Error::msg(format!("unknown XID format {:#x}", info[0])));
                    }
                    let saddr = read_u32(info, 1)?;
                    let daddr = read_u32(info, 5)?;
                    let discovery = if info.len() > 12 {
                        // The sender's identity: its address is our daddr.
                        Some(Discovery::parse(&info[12..], saddr, daddr)?)
                    } else {
                        None
                    };
                    FrameType::Xid(Xid {
                        saddr,
                        daddr,
                        slots: discovery::flags_to_slot_count(info[9]),
                        slot: info[10],
                        version: info[11],
                        discovery,
                    })
                }
                CONTROL_TEST => {
                    if info.len() < 8 {
                        return Err(Error::msg("TEST frame too short"));
                    }
                    FrameType::Test(Test {
                        poll,
                        saddr: read_u32(info, 0)?,
                        daddr: read_u32(info, 4)?,
                        payload: info[8..].to_vec(),
                    })
                }
                c => {
                    return Err(Error::msg(format!(
                        "unknown control {c:#x} (command={command})"
                    )))
                }
            },
        };
        Ok(Frame {
            caddr,
            command,
            frame_type,
        })
    }
}

/// The device below: frame transport and media sensing.
pub trait Device {
    fn send_frame(&mut self, frame: &Frame) -> Result<()>;

    /// True if someone else has been heard on the medium recently.
    fn is_media_busy(&self) -> bool;

    /// True if a frame is being received right now.
    fn is_receiving(&self) -> bool;

    /// Switch the line speed, once the current frame has gone out.
    fn change_speed(&mut self, _baud_rate: u32) {}
}

/// Why a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    DiscIndication,
    NoResponse,
    FoundNone,
    MediaBusy,
    ResetIndication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No answer from the peer for a while. The link is still up.
    NoActivity,
}

/// The layer above (IrLMP).
pub trait Upper {
    /// Peer wants to connect. Answer with `Link::connect_response`.
    fn connect_indication(&mut self, info: &SnrmInfo);
    fn connect_confirm(&mut self, qos_tx: &Qos);
    fn disconnect_indication(&mut self, reason: Reason);
    fn data_indication(&mut self, data: Vec<u8>, unreliable: bool);
    fn unitdata_indication(&mut self, data: Vec<u8>);
    fn discovery_indication(&mut self, discovery: Discovery);
    /// `None` if discovery could not run.
    fn discovery_confirm(&mut self, log: Option<DiscoveryLog>);
    fn reset_indication(&mut self);
    fn reset_confirm(&mut self);
    fn status_indication(&mut self, status: LinkStatus);
}

/// Everything sent upward, as data. Handy for queues and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    Connect(SnrmInfo),
    ConnectConfirm(Qos),
    Disconnect(Reason),
    Data(Vec<u8>, bool),
    Unitdata(Vec<u8>),
    Discovery(Discovery),
    DiscoveryConfirm(Option<DiscoveryLog>),
    Reset,
    ResetConfirm,
    Status(LinkStatus),
}

impl Indication {
    /// Deliver to an `Upper`.
    pub fn deliver(self, upper: &mut dyn Upper) {
        match self {
            Indication::Connect(info) => upper.connect_indication(&info),
            Indication::ConnectConfirm(q) => upper.connect_confirm(&q),
            Indication::Disconnect(r) => upper.disconnect_indication(r),
            Indication::Data(d, unreliable) => upper.data_indication(d, unreliable),
            Indication::Unitdata(d) => upper.unitdata_indication(d),
            Indication::Discovery(d) => upper.discovery_indication(d),
            Indication::DiscoveryConfirm(log) => upper.discovery_confirm(log),
            Indication::Reset => upper.reset_indication(),
            Indication::ResetConfirm => upper.reset_confirm(),
            Indication::Status(s) => upper.status_indication(s),
        }
    }
}

/// Collects indications in order.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<Indication>,
}

impl Recorder {
    pub fn take(&mut self) -> Vec<Indication> {
        std::mem::take(&mut self.events)
    }
}

impl Upper for Recorder {
    fn connect_indication(&mut self, info: &SnrmInfo) {
        self.events.push(Indication::Connect(info.clone()));
    }
    fn connect_confirm(&mut self, qos_tx: &Qos) {
        self.events.push(Indication::ConnectConfirm(*qos_tx));
    }
    fn disconnect_indication(&mut self, reason: Reason) {
        self.events.push(Indication::Disconnect(reason));
    }
    fn data_indication(&mut self, data: Vec<u8>, unreliable: bool) {
        self.events.push(Indication::Data(data, unreliable));
    }
    fn unitdata_indication(&mut self, data: Vec<u8>) {
        self.events.push(Indication::Unitdata(data));
    }
    fn discovery_indication(&mut self, discovery: Discovery) {
        self.events.push(Indication::Discovery(discovery));
    }
    fn discovery_confirm(&mut self, log: Option<DiscoveryLog>) {
        self.events.push(Indication::DiscoveryConfirm(log));
    }
    fn reset_indication(&mut self) {
        self.events.push(Indication::Reset);
    }
    fn reset_confirm(&mut self) {
        self.events.push(Indication::ResetConfirm);
    }
    fn status_indication(&mut self, status: LinkStatus) {
        self.events.push(Indication::Status(status));
    }
}

#[cfg(test)]
#[derive(Default, Debug)]
pub(crate) struct FakeDevice {
    pub sent: Vec<Frame>,
    pub media_busy: bool,
    pub receiving: bool,
    pub speed: Option<u32>,
}

#[cfg(test)]
impl FakeDevice {
    /// Frames sent since last call.
    pub fn take(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.sent)
    }
}

#[cfg(test)]
impl Device for FakeDevice {
    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        // Everything we send must survive the wire.
        assert_eq!(&Frame::parse(&frame.serialize())?, frame);
        self.sent.push(frame.clone());
        Ok(())
    }
    fn is_media_busy(&self) -> bool {
        self.media_busy
    }
    fn is_receiving(&self) -> bool {
        self.receiving
    }
    fn change_speed(&mut self, baud_rate: u32) {
        self.speed = Some(baud_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_rr() {
        let f = Frame::new(
            0x42,
            true,
            FrameType::Rr(Supervisory { poll: true, nr: 5 }),
        );
        assert_eq!(f.serialize(), vec![0x43, 0xb1]);
    }

    #[test]
    fn serialize_iframe() -> Result<()> {
        let f = Frame::new(
            0x42,
            false,
            FrameType::Iframe(Iframe {
                poll: true,
                ns: 3,
                nr: 6,
                payload: vec![1, 2, 3],
            }),
        );
        let b = f.serialize();
        assert_eq!(b, vec![0x42, 0b1101_0110, 1, 2, 3]);
        assert_eq!(Frame::parse(&b)?, f);
        Ok(())
    }

    #[test]
    fn disc_versus_rd() -> Result<()> {
        assert_eq!(Frame::parse(&[0x43, 0x53])?.frame_type, FrameType::Disc(true));
        assert_eq!(Frame::parse(&[0x42, 0x53])?.frame_type, FrameType::Rd(true));
        Ok(())
    }

    #[test]
    fn parse_snrm() -> Result<()> {
        let f = Frame::new(
            CBROADCAST,
            true,
            FrameType::Snrm(Snrm {
                poll: true,
                info: Some(SnrmInfo {
                    saddr: 0x11223344,
                    daddr: 0x55667788,
                    ncaddr: 0x42,
                    qos: QosCaps::default(),
                }),
            }),
        );
        let b = f.serialize();
        assert_eq!(&b[..4], &[0xff, 0x93, 0x44, 0x33]);
        assert_eq!(Frame::parse(&b)?, f);

        // Reset SNRM has no info.
        let f = Frame::parse(&[0x43, 0x93])?;
        assert_eq!(
            f.frame_type,
            FrameType::Snrm(Snrm {
                poll: true,
                info: None
            })
        );
        Ok(())
    }

    #[test]
    fn parse_xid() -> Result<()> {
        let f = Frame::new(
            CBROADCAST,
            false,
            FrameType::Xid(Xid {
                saddr: 2,
                daddr: 1,
                slots: 6,
                slot: 3,
                version: 0,
                discovery: Some(Discovery {
                    daddr: 2,
                    saddr: 1,
                    hints: [0x84, 0x00],
                    charset: 0,
                    nickname: "printer".into(),
                }),
            }),
        );
        assert_eq!(Frame::parse(&f.serialize())?, f);
        Ok(())
    }

    #[test]
    fn malformed() {
        assert!(Frame::parse(&[0x43]).is_err());
        // SNRM with a truncated info field.
        assert!(Frame::parse(&[0xff, 0x93, 1, 2, 3]).is_err());
        assert!(Frame::parse(&[0xff, 0x3f, 0x01, 0, 0]).is_err());
        assert!(Frame::parse(&[0xff, 0xe3, 1]).is_err());
        // Unknown U-frame.
        assert!(Frame::parse(&[0x43, 0xff]).is_err());
    }
}
