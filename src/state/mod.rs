//! The IrLAP link state machine.
//!
//! One `State` per link. Each event is fed to the handler of the current
//! state, which returns the next state and a `Status`. Side effects (frames,
//! timers, indications) are collected as `Action`s and carried out by the
//! driver in `crate::link`, in order, after the handler returns.
//!
//! Sequence numbers are modulo 8 throughout.
use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::link::Config;
use crate::qos::{self, Qos};
use crate::timer::TimerKind;
use crate::{
    Device, DiscoveryLog, Frame, FrameType, Frmr, Iframe, Indication, Snrm, SnrmInfo,
    Supervisory, Test, Ua, UaInfo, Ui, Xid, CBROADCAST, DEV_BROADCAST,
};

mod ndm;
mod primary;
mod reset;
mod secondary;
mod setup;

// NDM defaults, before anything is negotiated.
pub const FINAL_TIMEOUT: Duration = Duration::from_millis(500);
pub const POLL_TIMEOUT: Duration = Duration::from_millis(450);
pub const WD_TIMEOUT: Duration = Duration::from_millis(900);
pub const SLOT_TIMEOUT: Duration = Duration::from_millis(90);
pub const MEDIABUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// Events consumed by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // Local requests.
    DiscoveryRequest { slots: u8 },
    ConnectRequest { daddr: u32 },
    ConnectResponse,
    DisconnectRequest,
    DataRequest,
    ResetRequest,
    ResetResponse,
    SendICmd,
    SendUiFrame,

    // Received frames.
    RecvSnrmCmd(Snrm),
    RecvUaRsp(Ua),
    RecvDiscCmd(bool),
    RecvRdRsp(bool),
    RecvDmRsp(bool),
    RecvRrCmd(Supervisory),
    RecvRrRsp(Supervisory),
    RecvRnrCmd(Supervisory),
    RecvRnrRsp(Supervisory),
    RecvRejCmd(Supervisory),
    RecvRejRsp(Supervisory),
    RecvSrejCmd(Supervisory),
    RecvSrejRsp(Supervisory),
    RecvICmd(Iframe),
    RecvIRsp(Iframe),
    RecvUiFrame(Ui),
    RecvXidCmd(Xid),
    RecvXidRsp(Xid),
    RecvTestCmd(Test),
    RecvTestRsp(Test),
    RecvFrmrRsp(Frmr),

    // Timers.
    SlotTimerExpired,
    QueryTimerExpired,
    FinalTimerExpired,
    PollTimerExpired,
    DiscoveryTimerExpired,
    WdTimerExpired,
    BackoffTimerExpired,
    MediaBusyTimerExpired,
}

impl Event {
    /// Map a received frame to its event. `None` for frames that make no
    /// sense in the direction they came.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let cmd = frame.command;
        Some(match frame.frame_type {
            FrameType::Snrm(f) if cmd => Event::RecvSnrmCmd(f),
            FrameType::Ua(f) if !cmd => Event::RecvUaRsp(f),
            FrameType::Disc(p) => Event::RecvDiscCmd(p),
            FrameType::Rd(p) => Event::RecvRdRsp(p),
            FrameType::Dm(p) if !cmd => Event::RecvDmRsp(p),
            FrameType::Rr(s) if cmd => Event::RecvRrCmd(s),
            FrameType::Rr(s) => Event::RecvRrRsp(s),
            FrameType::Rnr(s) if cmd => Event::RecvRnrCmd(s),
            FrameType::Rnr(s) => Event::RecvRnrRsp(s),
            FrameType::Rej(s) if cmd => Event::RecvRejCmd(s),
            FrameType::Rej(s) => Event::RecvRejRsp(s),
            FrameType::Srej(s) if cmd => Event::RecvSrejCmd(s),
            FrameType::Srej(s) => Event::RecvSrejRsp(s),
            FrameType::Iframe(f) if cmd => Event::RecvICmd(f),
            FrameType::Iframe(f) => Event::RecvIRsp(f),
            FrameType::Ui(f) => Event::RecvUiFrame(f),
            FrameType::Xid(x) if cmd => Event::RecvXidCmd(x),
            FrameType::Xid(x) => Event::RecvXidRsp(x),
            FrameType::Test(t) if cmd => Event::RecvTestCmd(t),
            FrameType::Test(t) => Event::RecvTestRsp(t),
            FrameType::Frmr(f) if !cmd => Event::RecvFrmrRsp(f),
            other => {
                debug!("Dropping {other:?} with command={cmd}");
                return None;
            }
        })
    }

    #[must_use]
    pub fn from_timer(kind: TimerKind) -> Self {
        match kind {
            TimerKind::Slot => Event::SlotTimerExpired,
            TimerKind::Query => Event::QueryTimerExpired,
            TimerKind::Final => Event::FinalTimerExpired,
            TimerKind::Poll => Event::PollTimerExpired,
            TimerKind::Watchdog => Event::WdTimerExpired,
            TimerKind::Backoff => Event::BackoffTimerExpired,
            TimerKind::MediaBusy => Event::MediaBusyTimerExpired,
            TimerKind::Discovery => Event::DiscoveryTimerExpired,
        }
    }

    /// Poll/final bit of a received frame event.
    #[must_use]
    pub fn poll(&self) -> Option<bool> {
        match self {
            Event::RecvSnrmCmd(f) => Some(f.poll),
            Event::RecvUaRsp(f) => Some(f.poll),
            Event::RecvDiscCmd(p) | Event::RecvRdRsp(p) | Event::RecvDmRsp(p) => Some(*p),
            Event::RecvRrCmd(s)
            | Event::RecvRrRsp(s)
            | Event::RecvRnrCmd(s)
            | Event::RecvRnrRsp(s)
            | Event::RecvRejCmd(s)
            | Event::RecvRejRsp(s)
            | Event::RecvSrejCmd(s)
            | Event::RecvSrejRsp(s) => Some(s.poll),
            Event::RecvICmd(f) | Event::RecvIRsp(f) => Some(f.poll),
            Event::RecvUiFrame(f) => Some(f.poll),
            Event::RecvXidCmd(_) | Event::RecvXidRsp(_) => Some(true),
            Event::RecvTestCmd(t) | Event::RecvTestRsp(t) => Some(t.poll),
            Event::RecvFrmrRsp(f) => Some(f.poll),
            _ => None,
        }
    }
}

/// Discovery in progress, as master.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// S: number of slots.
    pub slots: u8,
    /// s: next slot to send.
    pub s: u8,
    /// Already waited once for an incoming frame in this slot.
    pub add_wait: bool,
    pub log: DiscoveryLog,
}

/// Someone else's discovery in progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    /// The slot we picked.
    pub slot: u8,
    pub frame_sent: bool,
}

/// Peer sent SNRM; waiting for the upper layer to accept.
#[derive(Debug, Clone, PartialEq)]
pub struct Conn {
    pub peer: SnrmInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// Normal disconnected mode.
    Ndm,
    Query(Query),
    Reply(Reply),
    Conn(Conn),
    /// Sent SNRM, waiting for UA.
    Setup,
    /// Primary holding the floor.
    XmitP,
    /// Primary waiting for the secondary's burst. `add_wait` as in `Query`.
    NrmP { add_wait: bool },
    /// Primary sent DISC.
    Pclose,
    /// Sequence fault seen; `xmitflag` says whether we send the reset SNRM.
    ResetWait { xmitflag: bool },
    /// Reset SNRM sent or awaited.
    Reset,
    /// Secondary listening for a poll.
    NrmS,
    /// Secondary holding the floor.
    XmitS,
    /// Secondary sent RD.
    Sclose,
    /// Secondary got a reset SNRM, waiting for the upper layer.
    ResetCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl State {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            State::Ndm => "NDM",
            State::Query(_) => "QUERY",
            State::Reply(_) => "REPLY",
            State::Conn(_) => "CONN",
            State::Setup => "SETUP",
            State::XmitP => "XMIT_P",
            State::NrmP { .. } => "NRM_P",
            State::Pclose => "PCLOSE",
            State::ResetWait { .. } => "RESET_WAIT",
            State::Reset => "RESET",
            State::NrmS => "NRM_S",
            State::XmitS => "XMIT_S",
            State::Sclose => "SCLOSE",
            State::ResetCheck => "RESET_CHECK",
        }
    }

    /// Which data transfer role this state belongs to, if any.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        match self {
            State::XmitP | State::NrmP { .. } | State::Pclose => Some(Role::Primary),
            State::NrmS | State::XmitS | State::Sclose | State::ResetCheck => {
                Some(Role::Secondary)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_xmit(&self) -> bool {
        matches!(self, State::XmitP | State::XmitS)
    }

    #[must_use]
    pub fn is_ndm(&self) -> bool {
        matches!(self, State::Ndm)
    }

    /// States where a disconnect request is acted on at once. Elsewhere it
    /// is deferred until the link passes through a transmit state.
    #[must_use]
    pub fn takes_disconnect(&self) -> bool {
        matches!(
            self,
            State::XmitP | State::XmitS | State::Conn(_) | State::ResetWait { .. } | State::ResetCheck
        )
    }

    /// Feed one event to the handler of this state.
    pub(crate) fn handle(self, cx: &mut Cx<'_>, event: Event) -> Transition {
        match self {
            State::Ndm => ndm::ndm(cx, event),
            State::Query(q) => ndm::query(cx, q, event),
            State::Reply(r) => ndm::reply(cx, r, event),
            State::Conn(c) => setup::conn(cx, c, event),
            State::Setup => setup::setup(cx, event),
            State::XmitP => primary::xmit(cx, event),
            State::NrmP { add_wait } => primary::nrm(cx, add_wait, event),
            State::Pclose => primary::pclose(cx, event),
            State::ResetWait { xmitflag } => reset::reset_wait(cx, xmitflag, event),
            State::Reset => reset::reset(cx, event),
            State::NrmS => secondary::nrm(cx, event),
            State::XmitS => secondary::xmit(cx, event),
            State::Sclose => secondary::sclose(cx, event),
            State::ResetCheck => secondary::reset_check(cx, event),
        }
    }
}

/// Handler outcome, used only to steer the transmit drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Done,
    /// Nothing more can be sent right now.
    WouldBlock,
    /// Event not expected in this state; ignored.
    Unhandled,
}

#[derive(Debug)]
pub struct Transition {
    pub next: State,
    pub status: Status,
}

impl Transition {
    pub(crate) fn to(next: State) -> Self {
        Self {
            next,
            status: Status::Done,
        }
    }
    pub(crate) fn blocked(next: State) -> Self {
        Self {
            next,
            status: Status::WouldBlock,
        }
    }
    pub(crate) fn unhandled(state: State, event: &Event) -> Self {
        debug!("{}: ignoring {event:?}", state.name());
        Self {
            next: state,
            status: Status::Unhandled,
        }
    }
}

/// Side effects of a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(Frame),
    StartTimer(TimerKind, Duration),
    StopTimer(TimerKind),
    ChangeSpeed(u32),
    Indicate(Indication),
}

/// Data queued for sending.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub payload: Vec<u8>,
    pub unreliable: bool,
}

/// Sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sent {
    pub ns: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NsStatus {
    Expected,
    /// Missing or duplicate frame. Any 3-bit value can be a retransmission,
    /// so there is no invalid N(S).
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NrStatus {
    Expected,
    /// Acknowledges part of the window.
    Unexpected,
    /// Outside the window.
    Invalid,
}

/// The link control block.
#[derive(Debug)]
pub struct Data {
    pub(crate) config: Config,
    pub(crate) saddr: u32,
    pub(crate) daddr: u32,
    pub(crate) caddr: u8,

    pub(crate) vs: u8,
    pub(crate) vr: u8,
    /// Last acknowledged frame.
    pub(crate) va: u8,
    pub(crate) window: u8,
    pub(crate) window_size: u8,
    pub(crate) line_capacity: usize,
    pub(crate) bytes_left: usize,
    pub(crate) remote_busy: bool,

    pub(crate) retry_count: u32,
    /// No-activity warning interval, in retries. `None` when disabled.
    pub(crate) n1: Option<u32>,
    /// Retries before giving up on a connected link.
    pub(crate) n2: u32,
    /// Connection attempts before giving up.
    pub(crate) n3: u32,

    pub(crate) final_timeout: Duration,
    pub(crate) poll_timeout: Duration,
    pub(crate) wd_timeout: Duration,
    pub(crate) slot_timeout: Duration,

    pub(crate) txq: VecDeque<Outbound>,
    pub(crate) wx_list: VecDeque<Sent>,
    pub(crate) txq_ultra: VecDeque<Vec<u8>>,
    /// UI frames sent in NDM since the medium was last left alone.
    pub(crate) ultra_sent: usize,

    pub(crate) ack_required: bool,
    pub(crate) disconnect_pending: bool,
    pub(crate) connect_pending: Option<u32>,
    /// Current fast poll timeout while fast RR is in effect.
    pub(crate) fast_rr: Option<Duration>,

    pub(crate) qos_tx: Qos,
    pub(crate) qos_rx: Qos,

    pub(crate) rng: StdRng,
}

impl Data {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut d = Self {
            saddr: config.saddr,
            daddr: 0,
            caddr: CBROADCAST,
            vs: 0,
            vr: 0,
            va: 7,
            window: 1,
            window_size: 1,
            line_capacity: 0,
            bytes_left: 0,
            remote_busy: false,
            retry_count: 0,
            n1: None,
            n2: 0,
            n3: config.n3,
            final_timeout: FINAL_TIMEOUT,
            poll_timeout: POLL_TIMEOUT,
            wd_timeout: WD_TIMEOUT,
            slot_timeout: config.slot_timeout,
            txq: VecDeque::new(),
            wx_list: VecDeque::new(),
            txq_ultra: VecDeque::new(),
            ultra_sent: 0,
            ack_required: false,
            disconnect_pending: false,
            connect_pending: None,
            fast_rr: None,
            qos_tx: Qos::default_ndm(),
            qos_rx: Qos::default_ndm(),
            rng,
            config,
        };
        d.reset_defaults();
        if d.saddr == 0 || d.saddr == DEV_BROADCAST {
            d.saddr = loop {
                let a: u32 = d.rng.gen();
                if a != 0 && a != DEV_BROADCAST {
                    break a;
                }
            };
            debug!("Picked device address {:08x}", d.saddr);
        }
        d
    }

    fn reset_defaults(&mut self) {
        self.caddr = loop {
            let c = self.rng.gen::<u8>() & 0xfe;
            if c != 0 && c != CBROADCAST {
                break c;
            }
        };
        self.slot_timeout = self.config.slot_timeout;
        self.final_timeout = FINAL_TIMEOUT;
        self.poll_timeout = POLL_TIMEOUT;
        self.wd_timeout = WD_TIMEOUT;
        self.qos_tx = Qos::default_ndm();
        self.qos_rx = Qos::default_ndm();
        self.window_size = 1;
        self.flush_all_queues();
        self.ultra_sent = 0;
        self.disconnect_pending = false;
        self.fast_rr = None;
    }

    pub(crate) fn flush_all_queues(&mut self) {
        self.txq.clear();
        self.txq_ultra.clear();
        self.wx_list.clear();
    }

    /// Start of a connection, or after a reset.
    pub(crate) fn initiate_connection_state(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 7;
        self.window = 1;
        self.remote_busy = false;
        self.retry_count = 0;
        self.ack_required = false;
        self.wx_list.clear();
    }

    pub(crate) fn validate_ns(&self, ns: u8) -> NsStatus {
        if ns == self.vr {
            NsStatus::Expected
        } else {
            NsStatus::Unexpected
        }
    }

    pub(crate) fn validate_nr(&self, nr: u8) -> NrStatus {
        if nr == self.vs {
            return NrStatus::Expected;
        }
        let within = if self.va < self.vs {
            nr >= self.va && nr <= self.vs
        } else {
            nr >= self.va || nr <= self.vs
        };
        if within {
            NrStatus::Unexpected
        } else {
            NrStatus::Invalid
        }
    }

    /// Drop acknowledged frames from the retransmit window.
    pub(crate) fn update_nr_received(&mut self, nr: u8) {
        if nr == self.vs {
            self.wx_list.clear();
            self.va = (nr + 7) % 8;
        } else {
            while !self.wx_list.is_empty() && (self.va + 1) % 8 != nr {
                self.wx_list.pop_front();
                self.va = (self.va + 1) % 8;
            }
        }
        self.window = self
            .window_size
            .saturating_sub(self.wx_list.len().try_into().unwrap_or(u8::MAX));
    }

    pub(crate) fn next_vr(&mut self) {
        self.vr = (self.vr + 1) % 8;
    }
}

/// Handler context: the link data, a read-only view of the device, and
/// the side effects produced so far.
pub struct Cx<'a> {
    pub(crate) data: &'a mut Data,
    device: &'a dyn Device,
    pub(crate) actions: Vec<Action>,
    pub(crate) followups: VecDeque<Event>,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(data: &'a mut Data, device: &'a dyn Device) -> Self {
        Self {
            data,
            device,
            actions: Vec::new(),
            followups: VecDeque::new(),
        }
    }

    pub(crate) fn media_busy(&self) -> bool {
        self.device.is_media_busy()
    }

    pub(crate) fn receiving(&self) -> bool {
        self.device.is_receiving()
    }

    pub(crate) fn send(&mut self, command: bool, frame_type: FrameType) {
        trace!("-> {frame_type:?}");
        self.actions
            .push(Action::Send(Frame::new(self.data.caddr, command, frame_type)));
    }

    pub(crate) fn send_broadcast(&mut self, command: bool, frame_type: FrameType) {
        self.actions
            .push(Action::Send(Frame::new(CBROADCAST, command, frame_type)));
    }

    pub(crate) fn start_timer(&mut self, kind: TimerKind, duration: Duration) {
        self.actions.push(Action::StartTimer(kind, duration));
    }

    pub(crate) fn stop_timer(&mut self, kind: TimerKind) {
        self.actions.push(Action::StopTimer(kind));
    }

    pub(crate) fn indicate(&mut self, ind: Indication) {
        self.actions.push(Action::Indicate(ind));
    }

    /// Run another event after this one, before anything new arrives.
    pub(crate) fn follow_up(&mut self, event: Event) {
        self.followups.push_back(event);
    }

    pub(crate) fn start_final_timer(&mut self, timeout: Duration) {
        self.start_timer(TimerKind::Final, timeout);
    }

    pub(crate) fn start_wd_timer(&mut self) {
        let t = self.data.wd_timeout;
        self.start_timer(TimerKind::Watchdog, t);
    }

    /// Start the poll timer, shortened while the link is idle if fast RR is
    /// configured. A zero timeout polls at once.
    pub(crate) fn start_poll_timer(&mut self) {
        let mut timeout = self.data.poll_timeout;
        if let Some(increment) = self.data.config.fast_rr {
            if self.data.txq.is_empty() || self.data.remote_busy {
                match self.data.fast_rr {
                    Some(current) if current < timeout => {
                        let next = (current + increment).min(timeout);
                        self.data.fast_rr = Some(next);
                        timeout = next;
                    }
                    Some(_) => {}
                    None => {
                        self.data.fast_rr = Some(Duration::ZERO);
                        timeout = Duration::ZERO;
                    }
                }
            } else {
                self.data.fast_rr = None;
            }
        }
        if timeout.is_zero() {
            self.stop_timer(TimerKind::Poll);
            self.follow_up(Event::PollTimerExpired);
        } else {
            self.start_timer(TimerKind::Poll, timeout);
        }
    }

    pub(crate) fn send_rr(&mut self, command: bool) {
        let nr = self.data.vr;
        self.send(command, FrameType::Rr(Supervisory { poll: true, nr }));
    }

    pub(crate) fn send_rd(&mut self) {
        self.send(false, FrameType::Rd(true));
    }

    pub(crate) fn send_disc(&mut self) {
        self.send(true, FrameType::Disc(true));
    }

    pub(crate) fn send_dm(&mut self) {
        self.send(false, FrameType::Dm(true));
    }

    /// SNRM to connect (with our parameters) or to reset (bare).
    pub(crate) fn send_snrm(&mut self, with_qos: bool) {
        if with_qos {
            let info = SnrmInfo {
                saddr: self.data.saddr,
                daddr: self.data.daddr,
                ncaddr: self.data.caddr,
                qos: self.data.config.caps,
            };
            self.send_broadcast(
                true,
                FrameType::Snrm(Snrm {
                    poll: true,
                    info: Some(info),
                }),
            );
        } else {
            self.send(
                true,
                FrameType::Snrm(Snrm {
                    poll: true,
                    info: None,
                }),
            );
        }
    }

    pub(crate) fn send_ua(&mut self, with_qos: bool) {
        let info = with_qos.then(|| UaInfo {
            saddr: self.data.saddr,
            daddr: self.data.daddr,
            qos: self.data.config.caps,
        });
        self.send(false, FrameType::Ua(Ua { poll: true, info }));
    }

    pub(crate) fn send_i(&mut self, ns: u8, payload: Vec<u8>, poll: bool, command: bool) {
        let nr = self.data.vr;
        self.send(
            command,
            FrameType::Iframe(Iframe {
                poll,
                ns,
                nr,
                payload,
            }),
        );
    }

    pub(crate) fn send_ui(&mut self, payload: Vec<u8>, poll: bool, command: bool) {
        self.send(command, FrameType::Ui(Ui { poll, payload }));
    }

    /// Retransmit the whole unacknowledged window, poll/final on the last.
    pub(crate) fn resend_rejected_frames(&mut self, command: bool) {
        let frames: Vec<_> = self.data.wx_list.iter().cloned().collect();
        let last = frames.len().saturating_sub(1);
        for (i, f) in frames.into_iter().enumerate() {
            self.send_i(f.ns, f.payload, i == last, command);
        }
    }

    /// Retransmit only the oldest unacknowledged frame.
    pub(crate) fn resend_rejected_frame(&mut self, command: bool) {
        if let Some(f) = self.data.wx_list.front().cloned() {
            self.send_i(f.ns, f.payload, true, command);
        }
    }

    /// Send one queued frame in the middle of a burst.
    pub(crate) fn send_data(&mut self, out: Outbound, command: bool) {
        if out.unreliable {
            self.send_ui(out.payload, false, command);
        } else {
            let ns = self.data.vs;
            self.data.wx_list.push_back(Sent {
                ns,
                payload: out.payload.clone(),
            });
            self.data.vs = (self.data.vs + 1) % 8;
            self.data.ack_required = false;
            self.send_i(ns, out.payload, false, command);
        }
        self.data.window = self.data.window.saturating_sub(1);
    }

    /// Send the last frame of a burst, handing over the floor.
    fn send_data_final(&mut self, out: Outbound, command: bool) {
        if out.unreliable {
            if self.data.ack_required {
                self.send_ui(out.payload, false, command);
                self.send_rr(command);
                self.data.ack_required = false;
            } else {
                self.send_ui(out.payload, true, command);
            }
        } else {
            let ns = self.data.vs;
            self.data.wx_list.push_back(Sent {
                ns,
                payload: out.payload.clone(),
            });
            self.data.vs = (self.data.vs + 1) % 8;
            self.data.ack_required = false;
            self.send_i(ns, out.payload, true, command);
        }
        self.data.window = self.data.window_size;
    }

    /// Primary: last frame of our burst. Arms the final timer to cover both
    /// our transmission and the secondary's turn.
    pub(crate) fn send_data_primary_poll(&mut self, out: Outbound) {
        self.stop_timer(TimerKind::Poll);
        self.send_data_final(out, true);
        let mut transmission = self.data.final_timeout;
        if self.data.config.dynamic_window && self.data.line_capacity > 0 {
            // Pro rata of the byte budget we did not use.
            let unused = self.data.final_timeout.as_micros() * self.data.bytes_left as u128
                / self.data.line_capacity as u128;
            transmission = transmission
                .saturating_sub(Duration::from_micros(u64::try_from(unused).unwrap_or(u64::MAX)));
        }
        self.data.bytes_left = self.data.line_capacity;
        let t = self.data.final_timeout + transmission;
        self.start_final_timer(t);
    }

    /// Secondary: last frame of our burst.
    pub(crate) fn send_data_secondary_final(&mut self, out: Outbound) {
        self.send_data_final(out, false);
        self.data.bytes_left = self.data.line_capacity;
        self.start_wd_timer();
    }

    /// Admission checks for the frame at the head of `txq`.
    ///
    /// Returns `None` if it cannot go now. Otherwise takes it off the queue
    /// and says whether more frames may follow it in this burst.
    pub(crate) fn next_to_send(&mut self) -> Option<(Outbound, bool)> {
        if self.data.window == 0 || self.data.remote_busy {
            debug!(
                "Unable to send: window={} remote_busy={}",
                self.data.window, self.data.remote_busy
            );
            return None;
        }
        let len = self.data.txq.front()?.payload.len();
        let nextfit = if self.data.config.dynamic_window {
            let fits = self
                .data
                .txq
                .get(1)
                .is_some_and(|next| next.payload.len() + len <= self.data.bytes_left);
            // A frame bigger than the whole budget still goes, alone.
            let budget_full = self.data.bytes_left >= self.data.line_capacity;
            if !fits && len > self.data.bytes_left && !budget_full {
                debug!(
                    "Not allowed to transmit {len} more bytes, {} left",
                    self.data.bytes_left
                );
                return None;
            }
            self.data.bytes_left = self.data.bytes_left.saturating_sub(len);
            fits
        } else {
            self.data.txq.len() > 1
        };
        let out = self.data.txq.pop_front()?;
        Some((out, nextfit && self.data.window > 1))
    }

    /// Back to NDM parameters: 9600 bps, new connection address, queues
    /// flushed.
    pub(crate) fn apply_default_connection_parameters(&mut self) {
        self.data.reset_defaults();
        self.actions.push(Action::ChangeSpeed(9600));
    }

    pub(crate) fn apply_connection_parameters(&mut self, tx: Qos, rx: Qos) {
        let d = &mut *self.data;
        d.qos_tx = tx;
        d.qos_rx = rx;
        d.window_size = tx.window_size;
        d.window = tx.window_size;
        d.line_capacity = qos::line_capacity(tx.baud_rate, tx.max_turn_time);
        d.bytes_left = d.line_capacity;

        let own_turn = if tx.max_turn_time == 0 { 500 } else { tx.max_turn_time };
        let peer_turn = if rx.max_turn_time == 0 { 500 } else { rx.max_turn_time };
        d.poll_timeout = Duration::from_millis(own_turn.into());
        d.final_timeout = Duration::from_millis(peer_turn.into());
        d.wd_timeout = d.final_timeout * 2;

        let warn = d.config.warn_noreply_time;
        d.n1 = if tx.link_disc_time == warn {
            None
        } else {
            Some((warn * 1000 / peer_turn).max(2))
        };
        d.n2 = (tx.link_disc_time * 1000 / peer_turn).max(2);
        debug!(
            "Connection parameters: window={} capacity={} N1={:?} N2={} final={:?}",
            d.window_size, d.line_capacity, d.n1, d.n2, d.final_timeout
        );
        self.actions.push(Action::ChangeSpeed(tx.baud_rate));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::Link;
    use crate::{FakeDevice, Recorder};

    pub(crate) const ME: u32 = 0x1000_0001;
    pub(crate) const PEER: u32 = 0x2000_0002;

    pub(crate) fn config() -> Config {
        Config {
            saddr: ME,
            seed: Some(42),
            ..Config::default()
        }
    }

    pub(crate) type TestLink = Link<FakeDevice, Recorder>;

    pub(crate) fn link() -> TestLink {
        Link::new(config(), FakeDevice::default(), Recorder::default())
    }

    pub(crate) fn rsp(link: &TestLink, frame_type: FrameType) -> Frame {
        Frame::new(link.data().caddr, false, frame_type)
    }

    pub(crate) fn cmd(link: &TestLink, frame_type: FrameType) -> Frame {
        Frame::new(link.data().caddr, true, frame_type)
    }

    pub(crate) fn rr(nr: u8, poll: bool) -> Supervisory {
        Supervisory { poll, nr }
    }

    pub(crate) fn iframe(ns: u8, nr: u8, poll: bool, payload: &[u8]) -> Iframe {
        Iframe {
            poll,
            ns,
            nr,
            payload: payload.to_vec(),
        }
    }

    /// A link that connected to PEER as primary and got its UA.
    pub(crate) fn primary() -> TestLink {
        let mut l = link();
        l.connect_request(PEER);
        let ua = rsp(
            &l,
            FrameType::Ua(Ua {
                poll: true,
                info: Some(UaInfo {
                    saddr: PEER,
                    daddr: ME,
                    qos: crate::QosCaps::default(),
                }),
            }),
        );
        l.receive_frame(ua);
        l.device_mut().take();
        l.upper_mut().take();
        l
    }

    /// A primary that has the floor.
    pub(crate) fn primary_xmit() -> TestLink {
        let mut l = primary();
        let f = rsp(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::XmitP);
        l.device_mut().take();
        l
    }

    /// A link that accepted PEER's SNRM and is secondary.
    pub(crate) fn secondary() -> TestLink {
        let mut l = link();
        let snrm = Frame::new(
            CBROADCAST,
            true,
            FrameType::Snrm(Snrm {
                poll: true,
                info: Some(SnrmInfo {
                    saddr: PEER,
                    daddr: ME,
                    ncaddr: 0x42,
                    qos: crate::QosCaps::default(),
                }),
            }),
        );
        l.receive_frame(snrm);
        l.connect_response();
        assert_eq!(l.state(), &State::NrmS);
        l.device_mut().take();
        l.upper_mut().take();
        l
    }

    fn data() -> Data {
        Data::new(config())
    }

    #[test]
    fn nr_validation() {
        let mut d = data();
        d.initiate_connection_state();
        // Nothing outstanding.
        assert_eq!(d.validate_nr(0), NrStatus::Expected);
        // Three frames outstanding: ns 0, 1, 2.
        d.vs = 3;
        assert_eq!(d.validate_nr(3), NrStatus::Expected);
        assert_eq!(d.validate_nr(1), NrStatus::Unexpected);
        assert_eq!(d.validate_nr(0), NrStatus::Unexpected);
        assert_eq!(d.validate_nr(5), NrStatus::Unexpected); // va=7 wraps.
        d.va = 0;
        assert_eq!(d.validate_nr(5), NrStatus::Invalid);
        assert_eq!(d.validate_nr(2), NrStatus::Unexpected);
    }

    #[test]
    fn ns_validation() {
        let mut d = data();
        d.vr = 4;
        assert_eq!(d.validate_ns(4), NsStatus::Expected);
        assert_eq!(d.validate_ns(3), NsStatus::Unexpected);
        assert_eq!(d.validate_ns(5), NsStatus::Unexpected);
    }

    #[test]
    fn update_nr_partial_ack() {
        let mut d = data();
        d.initiate_connection_state();
        d.window_size = 7;
        for ns in 0..4 {
            d.wx_list.push_back(Sent {
                ns,
                payload: vec![ns],
            });
        }
        d.vs = 4;
        d.update_nr_received(2);
        assert_eq!(d.va, 1);
        assert_eq!(d.wx_list.iter().map(|s| s.ns).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(d.window, 5);
        d.update_nr_received(4);
        assert!(d.wx_list.is_empty());
        assert_eq!(d.va, 3);
        assert_eq!(d.window, 7);
    }

    #[test]
    fn update_nr_wraps() {
        let mut d = data();
        d.initiate_connection_state();
        d.window_size = 7;
        d.va = 5;
        d.vs = 1;
        for ns in [6, 7, 0] {
            d.wx_list.push_back(Sent {
                ns,
                payload: vec![],
            });
        }
        d.update_nr_received(0);
        assert_eq!(d.va, 7);
        assert_eq!(d.wx_list.len(), 1);
        assert_eq!(d.window, 6);
        d.update_nr_received(1);
        assert_eq!(d.va, 0);
        assert!(d.wx_list.is_empty());
    }

    #[test]
    fn caddr_never_reserved() {
        let mut d = data();
        for _ in 0..200 {
            d.reset_defaults();
            assert_ne!(d.caddr, 0);
            assert_ne!(d.caddr, CBROADCAST);
            assert_eq!(d.caddr & 1, 0);
        }
    }

    #[test]
    fn role_is_exclusive() {
        assert_eq!(State::XmitP.role(), Some(Role::Primary));
        assert_eq!(State::NrmP { add_wait: false }.role(), Some(Role::Primary));
        assert_eq!(State::Pclose.role(), Some(Role::Primary));
        for s in [State::NrmS, State::XmitS, State::Sclose, State::ResetCheck] {
            assert_eq!(s.role(), Some(Role::Secondary));
        }
        assert_eq!(State::Ndm.role(), None);
        assert_eq!(State::Setup.role(), None);
    }

    #[test]
    fn frame_events() {
        let f = Frame::new(0x42, true, FrameType::Rr(rr(3, true)));
        assert_eq!(Event::from_frame(f), Some(Event::RecvRrCmd(rr(3, true))));
        let f = Frame::new(0x42, false, FrameType::Rr(rr(3, false)));
        assert_eq!(Event::from_frame(f), Some(Event::RecvRrRsp(rr(3, false))));
        // UA as a command makes no sense.
        let f = Frame::new(
            0x42,
            true,
            FrameType::Ua(Ua {
                poll: true,
                info: None,
            }),
        );
        assert_eq!(Event::from_frame(f), None);
    }
}
