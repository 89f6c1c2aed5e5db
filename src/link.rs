//! Link driver.
//!
//! `Link` owns the state machine, its timers, the device below and the
//! layer above. Requests from above and frames from below are turned into
//! events, run through the current state, and the resulting actions are
//! carried out here.
//!
//! Nothing in here blocks or sleeps. Whoever owns the link must feed it
//! received frames and call `poll_timers` (or `fire_timer`) when
//! `next_deadline` passes. See `crate::r#async` for a tokio runner.
//!
//! # Example
//!
//! ```
//! use irlap::{Config, Device, Frame, Link, Recorder};
//!
//! struct Null;
//! impl Device for Null {
//!     fn send_frame(&mut self, _frame: &Frame) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!     fn is_media_busy(&self) -> bool {
//!         false
//!     }
//!     fn is_receiving(&self) -> bool {
//!         false
//!     }
//! }
//!
//! let mut link = Link::new(Config::default(), Null, Recorder::default());
//! link.discovery_request(6)?;
//! assert!(!link.is_connected());
//! # Ok::<(), anyhow::Error>(())
//! ```
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, trace, warn};

use crate::discovery;
use crate::qos::{Qos, QosCaps};
use crate::state::{Action, Cx, Data, Event, Outbound, State, Status, Transition};
use crate::timer::{TimerKind, TimerTable, TimerToken};
use crate::{Device, Frame, FrameType, Indication, Upper, CBROADCAST, DEV_BROADCAST};

/// Link configuration. Everything not negotiated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Our device address. 0 picks a random one.
    pub saddr: u32,
    /// What we offer in SNRM/UA.
    pub caps: QosCaps,
    /// Service hints sent in discovery.
    pub hints: [u8; 2],
    pub charset: u8,
    pub nickname: String,
    /// SNRM attempts before giving up on a connect.
    pub n3: u32,
    pub slot_timeout: Duration,
    /// Limit each burst to what the line carries in one turn.
    pub dynamic_window: bool,
    /// Fast RR increment. `None` always polls at the negotiated interval.
    pub fast_rr: Option<Duration>,
    /// Seconds of silence before warning the upper layer.
    pub warn_noreply_time: u32,
    /// Fixed seed for slot choice, backoff and connection addresses.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            saddr: 0,
            caps: QosCaps::default(),
            hints: [0x04, 0x00], // Computer.
            charset: 0,
            nickname: "irlap".to_string(),
            n3: 3,
            slot_timeout: crate::state::SLOT_TIMEOUT,
            dynamic_window: true,
            fast_rr: None,
            warn_noreply_time: 3,
            seed: None,
        }
    }
}

/// One IrLAP link over one device.
pub struct Link<D: Device, U: Upper> {
    state: State,
    data: Data,
    timers: TimerTable,
    device: D,
    upper: U,
}

impl<D: Device, U: Upper> Link<D, U> {
    pub fn new(config: Config, device: D, upper: U) -> Self {
        let data = Data::new(config);
        debug!(
            "New link, address {:08x} caddr {:#04x}",
            data.saddr, data.caddr
        );
        Self {
            state: State::Ndm,
            data,
            timers: TimerTable::new(),
            device,
            upper,
        }
    }

    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[must_use]
    pub fn data(&self) -> &Data {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn data_mut(&mut self) -> &mut Data {
        &mut self.data
    }

    #[must_use]
    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    #[must_use]
    pub fn upper(&self) -> &U {
        &self.upper
    }

    pub fn upper_mut(&mut self) -> &mut U {
        &mut self.upper
    }

    /// Our device address.
    #[must_use]
    pub fn saddr(&self) -> u32 {
        self.data.saddr
    }

    /// True from connect confirm/response until disconnect.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.role().is_some()
    }

    /// Parameters we transmit with. NDM defaults when not connected.
    #[must_use]
    pub fn qos_tx(&self) -> Qos {
        self.data.qos_tx
    }

    /// Run a discovery with `slots` slots (1, 6, 8 or 16).
    ///
    /// The result comes back as a discovery confirm.
    pub fn discovery_request(&mut self, slots: u8) -> Result<()> {
        discovery::slot_count_to_flags(slots)?;
        if !self.state.is_ndm() {
            debug!("Discovery only possible in NDM, not {}", self.state.name());
            Indication::DiscoveryConfirm(None).deliver(&mut self.upper);
            return Ok(());
        }
        self.dispatch(Event::DiscoveryRequest { slots });
        Ok(())
    }

    /// Connect to `daddr`. If the link is busy (e.g. discovering), the
    /// connect is issued when it gets back to NDM.
    pub fn connect_request(&mut self, daddr: u32) {
        if self.state.is_ndm() {
            self.dispatch(Event::ConnectRequest { daddr });
        } else {
            debug!("Deferring connect to {daddr:08x} in {}", self.state.name());
            self.data.connect_pending = Some(daddr);
        }
    }

    /// Accept the connection from the last connect indication.
    pub fn connect_response(&mut self) {
        self.dispatch(Event::ConnectResponse);
    }

    /// Tear the link down, or refuse an incoming connection.
    ///
    /// Queued data is sent first.
    pub fn disconnect_request(&mut self) {
        if matches!(self.state, State::Ndm | State::Query(_) | State::Reply(_)) {
            debug!("Disconnect in {}, nothing to do", self.state.name());
            return;
        }
        if !self.data.txq.is_empty() || !self.state.takes_disconnect() {
            debug!("Disconnect deferred in {}", self.state.name());
            self.data.disconnect_pending = true;
            return;
        }
        self.dispatch(Event::DisconnectRequest);
    }

    /// Queue data for the peer. Unreliable data goes as UI frames.
    ///
    /// Payloads larger than the negotiated data size are refused. Before
    /// negotiation the limit is the largest data size we offer.
    pub fn data_request(&mut self, payload: Vec<u8>, unreliable: bool) -> Result<()> {
        if matches!(self.state, State::Ndm | State::Query(_) | State::Reply(_)) {
            warn!("Not connected, dropping {} bytes", payload.len());
            return Ok(());
        }
        let max = if self.is_connected() {
            self.data.qos_tx.data_size
        } else {
            self.data.config.caps.values()?.data_size
        };
        if payload.len() > max {
            return Err(Error::msg(format!(
                "payload of {} bytes exceeds data size {max}",
                payload.len()
            )));
        }
        self.data.txq.push_back(Outbound {
            payload,
            unreliable,
        });
        // Otherwise it goes at the next poll, or the drain already running.
        if self.state.is_xmit() && self.data.txq.len() <= 1 {
            self.dispatch(Event::DataRequest);
        }
        Ok(())
    }

    /// Connectionless UI data, only while disconnected.
    pub fn unitdata_request(&mut self, payload: Vec<u8>) {
        if !self.state.is_ndm() {
            warn!(
                "Unitdata only in NDM, dropping {} bytes in {}",
                payload.len(),
                self.state.name()
            );
            return;
        }
        self.data.txq_ultra.push_back(payload);
        self.dispatch(Event::SendUiFrame);
    }

    /// Answer a reset indication on the primary side.
    pub fn reset_request(&mut self) {
        self.dispatch(Event::ResetRequest);
    }

    /// Accept a reset from the primary.
    pub fn reset_response(&mut self) {
        self.dispatch(Event::ResetResponse);
    }

    /// Handle one received frame, without BOF/EOF and FCS.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = Frame::parse(bytes)?;
        self.receive_frame(frame);
        Ok(())
    }

    pub fn receive_frame(&mut self, frame: Frame) {
        if frame.caddr != self.data.caddr && frame.caddr != CBROADCAST {
            trace!("Not our connection: {:#04x}", frame.caddr);
            return;
        }
        if let FrameType::Xid(x) = &frame.frame_type {
            let for_us = x.daddr == self.data.saddr || (frame.command && x.daddr == DEV_BROADCAST);
            if !for_us {
                trace!("XID for {:08x}, not us", x.daddr);
                return;
            }
        }
        trace!("<- {frame:?}");
        if let Some(event) = Event::from_frame(frame) {
            self.dispatch(event);
        }
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        for token in self.timers.due(now) {
            self.fire_timer(token);
        }
    }

    /// Fire one timer. False if the token is stale.
    pub fn fire_timer(&mut self, token: TimerToken) -> bool {
        if !self.timers.fire(token) {
            trace!("Stale {:?} timer", token.kind);
            return false;
        }
        self.dispatch(Event::from_timer(token.kind));
        true
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run an event, and everything that follows from it.
    pub(crate) fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            self.step(event, &mut queue);
            self.after_step(&mut queue);
        }
    }

    fn step(&mut self, event: Event, queue: &mut VecDeque<Event>) -> Status {
        let state = std::mem::replace(&mut self.state, State::Ndm);
        let from = state.name();
        trace!("{from}: {event:?}");
        let mut cx = Cx::new(&mut self.data, &self.device);
        let Transition { next, status } = state.handle(&mut cx, event);
        let actions = std::mem::take(&mut cx.actions);
        let followups = std::mem::take(&mut cx.followups);
        if next.name() != from {
            debug!("{from} -> {}", next.name());
        }
        self.state = next;
        for action in actions {
            self.execute(action);
        }
        queue.extend(followups);
        status
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Send(frame) => {
                if let Err(e) = self.device.send_frame(&frame) {
                    warn!("Failed to send {frame:?}: {e}");
                }
            }
            Action::StartTimer(kind, duration) => {
                self.timers.start(kind, duration);
            }
            Action::StopTimer(kind) => self.timers.stop(kind),
            Action::ChangeSpeed(baud) => {
                debug!("Speed {baud}");
                self.device.change_speed(baud);
            }
            Action::Indicate(ind) => ind.deliver(&mut self.upper),
        }
    }

    /// Send what the window allows while we hold the floor, then act on
    /// whatever was deferred until now.
    fn after_step(&mut self, queue: &mut VecDeque<Event>) {
        while self.state.is_xmit() && !self.data.txq.is_empty() {
            if self.step(Event::SendICmd, queue) == Status::WouldBlock {
                break;
            }
        }
        if self.state.is_xmit() && self.data.disconnect_pending && self.data.txq.is_empty() {
            self.data.disconnect_pending = false;
            self.step(Event::DisconnectRequest, queue);
        }
        if self.state.is_ndm() {
            if let Some(daddr) = self.data.connect_pending.take() {
                debug!("Issuing deferred connect to {daddr:08x}");
                self.step(Event::ConnectRequest { daddr }, queue);
            }
        }
    }

    /// Expire a running timer right now.
    #[cfg(test)]
    pub(crate) fn expire(&mut self, kind: TimerKind) {
        let token = self
            .timers
            .token(kind)
            .unwrap_or_else(|| panic!("{kind:?} timer not running in {}", self.state.name()));
        assert!(self.fire_timer(token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::{config, link, primary, rr, rsp, secondary, TestLink, ME, PEER};
    use crate::{FakeDevice, Reason, Recorder, Supervisory, Xid};

    /// Move frames between two links until both are quiet.
    fn shuttle(a: &mut TestLink, b: &mut TestLink) -> Result<usize> {
        let mut n = 0;
        loop {
            let from_a = a.device_mut().take();
            let from_b = b.device_mut().take();
            if from_a.is_empty() && from_b.is_empty() {
                return Ok(n);
            }
            n += from_a.len() + from_b.len();
            for f in from_a {
                b.receive(&f.serialize())?;
            }
            for f in from_b {
                a.receive(&f.serialize())?;
            }
        }
    }

    fn peer() -> TestLink {
        Link::new(
            Config {
                saddr: PEER,
                seed: Some(7),
                ..Config::default()
            },
            FakeDevice::default(),
            Recorder::default(),
        )
    }

    #[test]
    fn back_to_back() -> Result<()> {
        let mut a = link();
        let mut b = peer();

        a.connect_request(PEER);
        shuttle(&mut a, &mut b)?;
        assert!(matches!(b.state(), State::Conn(_)));
        b.connect_response();
        shuttle(&mut a, &mut b)?;
        assert_eq!(a.state(), &State::XmitP);
        assert_eq!(b.state(), &State::NrmS);
        assert!(a.is_connected() && b.is_connected());
        assert!(matches!(
            a.upper_mut().take().as_slice(),
            [Indication::ConnectConfirm(_)]
        ));
        assert!(matches!(
            b.upper_mut().take().as_slice(),
            [Indication::Connect(_)]
        ));

        a.data_request(b"hello".to_vec(), false).unwrap();
        shuttle(&mut a, &mut b)?;
        assert_eq!(
            b.upper_mut().take(),
            vec![Indication::Data(b"hello".to_vec(), false)]
        );
        assert_eq!(a.state(), &State::XmitP);
        assert!(a.data().wx_list.is_empty());

        b.data_request(b"world".to_vec(), false).unwrap();
        assert!(b.device_mut().sent.is_empty());
        a.expire(TimerKind::Poll);
        shuttle(&mut a, &mut b)?;
        assert_eq!(
            a.upper_mut().take(),
            vec![Indication::Data(b"world".to_vec(), false)]
        );

        a.disconnect_request();
        shuttle(&mut a, &mut b)?;
        assert_eq!(a.state(), &State::Ndm);
        assert_eq!(b.state(), &State::Ndm);
        assert_eq!(
            a.upper_mut().take(),
            vec![Indication::Disconnect(Reason::DiscIndication)]
        );
        assert_eq!(
            b.upper_mut().take(),
            vec![Indication::Disconnect(Reason::DiscIndication)]
        );
        Ok(())
    }

    #[test]
    fn discovery_finds_peer() -> Result<()> {
        let mut a = link();
        let mut b = peer();
        a.discovery_request(1)?;
        shuttle(&mut a, &mut b)?;
        while a.timers().is_running(TimerKind::Slot) {
            a.expire(TimerKind::Slot);
            shuttle(&mut a, &mut b)?;
        }
        let got = a.upper_mut().take();
        let [Indication::DiscoveryConfirm(Some(log))] = got.as_slice() else {
            panic!("unexpected {got:?}");
        };
        let found = log.get(PEER).map(|d| d.nickname.as_str());
        assert_eq!(found, Some("irlap"));
        // The peer saw the final slot and learnt who we are.
        let got = b.upper_mut().take();
        assert!(matches!(
            got.as_slice(),
            [Indication::Discovery(d)] if d.daddr == ME
        ));
        Ok(())
    }

    #[test]
    fn foreign_connection_ignored() {
        let mut l = secondary();
        let f = Frame::new(0x10, true, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert!(l.device_mut().take().is_empty());
        assert!(l.upper_mut().take().is_empty());
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(l.data().retry_count, 0);
    }

    #[test]
    fn xid_for_someone_else_ignored() -> Result<()> {
        let mut l = link();
        l.discovery_request(1)?;
        let f = Frame::new(
            CBROADCAST,
            false,
            FrameType::Xid(Xid {
                saddr: PEER,
                daddr: 0x3333_3333,
                slots: 1,
                slot: 0,
                version: 0,
                discovery: None,
            }),
        );
        l.receive_frame(f);
        l.expire(TimerKind::Slot);
        assert_eq!(
            l.upper_mut().take(),
            vec![Indication::DiscoveryConfirm(Some(crate::DiscoveryLog::new()))]
        );
        Ok(())
    }

    #[test]
    fn garbage_is_an_error() {
        let mut l = link();
        assert!(l.receive(&[0x43]).is_err());
        assert_eq!(l.state(), &State::Ndm);
    }

    #[test]
    fn bad_slot_count() {
        let mut l = link();
        assert!(l.discovery_request(5).is_err());
        assert_eq!(l.state(), &State::Ndm);
    }

    #[test]
    fn discovery_while_connected() -> Result<()> {
        let mut l = primary();
        l.discovery_request(6)?;
        assert_eq!(l.upper_mut().take(), vec![Indication::DiscoveryConfirm(None)]);
        assert_eq!(l.state(), &State::NrmP { add_wait: false });
        Ok(())
    }

    #[test]
    fn poll_timers_fires_due() {
        let mut l = link();
        l.connect_request(PEER);
        let deadline = l.next_deadline();
        assert!(deadline.is_some());
        l.poll_timers(deadline.unwrap_or_else(Instant::now));
        assert_eq!(l.state(), &State::Setup);
        assert!(!l.timers().is_running(TimerKind::Final));
        assert!(l.timers().is_running(TimerKind::Backoff));
    }

    #[test]
    fn stale_token_ignored() {
        let mut l = link();
        l.connect_request(PEER);
        let old = l.timers().token(TimerKind::Final);
        l.expire(TimerKind::Final);
        l.expire(TimerKind::Backoff);
        assert!(l.timers().is_running(TimerKind::Final));
        let old = old.unwrap_or_else(|| panic!("final timer was not running"));
        assert!(!l.fire_timer(old));
        assert!(l.timers().is_running(TimerKind::Final));
    }

    #[test]
    fn data_dropped_when_not_connected() {
        let mut l = link();
        l.data_request(b"x".to_vec(), false).unwrap();
        assert!(l.data().txq.is_empty());
        assert!(l.device_mut().take().is_empty());
    }

    #[test]
    fn connect_deferred_until_discovery_ends() -> Result<()> {
        let mut l = link();
        l.discovery_request(1)?;
        l.connect_request(PEER);
        assert!(matches!(l.state(), State::Query(_)));
        l.device_mut().take();
        l.expire(TimerKind::Slot);
        assert_eq!(l.state(), &State::Setup);
        let sent = l.device_mut().take();
        assert!(sent
            .iter()
            .any(|f| matches!(f.frame_type, FrameType::Snrm(_))));
        Ok(())
    }

    #[test]
    fn disconnect_waits_for_floor() {
        let mut l = primary();
        l.disconnect_request();
        assert_eq!(l.state(), &State::NrmP { add_wait: false });
        assert!(l.device_mut().take().is_empty());
        let f = rsp(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Pclose);
        assert!(matches!(
            l.device_mut().take().as_slice(),
            [Frame {
                frame_type: FrameType::Disc(true),
                ..
            }]
        ));
    }

    #[test]
    fn disconnect_waits_for_queue() {
        let mut l = primary();
        l.data_request(b"last".to_vec(), false).unwrap();
        l.disconnect_request();
        let f = rsp(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        // The data goes first, with the poll bit.
        assert_eq!(l.state(), &State::NrmP { add_wait: false });
        let sent = l.device_mut().take();
        assert!(matches!(
            sent.as_slice(),
            [Frame {
                frame_type: FrameType::Iframe(crate::Iframe { poll: true, .. }),
                ..
            }]
        ));
        let f = rsp(&l, FrameType::Rr(Supervisory { poll: true, nr: 1 }));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Pclose);
    }

    #[test]
    fn unitdata_only_when_disconnected() {
        let mut l = primary();
        l.unitdata_request(b"x".to_vec());
        assert!(l.data().txq_ultra.is_empty());
        assert!(l.device_mut().take().is_empty());
    }

    #[test]
    fn random_address_when_unset() {
        let l = Link::new(
            Config {
                saddr: 0,
                ..config()
            },
            FakeDevice::default(),
            Recorder::default(),
        );
        assert_ne!(l.saddr(), 0);
        assert_ne!(l.saddr(), DEV_BROADCAST);
    }
}
