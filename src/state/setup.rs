//! Connection establishment, from either side.
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use super::{Conn, Cx, Event, State, Transition};
use crate::qos::{self, QosCaps};
use crate::timer::TimerKind;
use crate::{Indication, Reason, Snrm, Ua};

/// Negotiate with the peer's advertised capabilities and switch to the
/// result. False if there is nothing in common.
fn negotiate(cx: &mut Cx<'_>, peer: &QosCaps) -> bool {
    match qos::negotiate(&cx.data.config.caps, peer) {
        Ok((tx, rx)) => {
            cx.apply_connection_parameters(tx, rx);
            true
        }
        Err(e) => {
            warn!("QoS negotiation with {:08x} failed: {e}", cx.data.daddr);
            false
        }
    }
}

/// Become secondary after accepting a SNRM.
fn accept(cx: &mut Cx<'_>, peer: &QosCaps) -> Option<State> {
    cx.data.initiate_connection_state();
    let (tx, rx) = match qos::negotiate(&cx.data.config.caps, peer) {
        Ok(v) => v,
        Err(e) => {
            warn!("QoS negotiation with {:08x} failed: {e}", cx.data.daddr);
            return None;
        }
    };
    // The UA goes out at the old speed.
    cx.send_ua(true);
    cx.apply_connection_parameters(tx, rx);
    cx.start_wd_timer();
    Some(State::NrmS)
}

pub(super) fn conn(cx: &mut Cx<'_>, c: Conn, event: Event) -> Transition {
    match event {
        Event::ConnectResponse => match accept(cx, &c.peer.qos) {
            Some(next) => {
                info!("Connected to {:08x} as secondary", cx.data.daddr);
                Transition::to(next)
            }
            None => {
                cx.send_dm();
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::DiscIndication));
                Transition::to(State::Ndm)
            }
        },
        Event::DisconnectRequest => {
            debug!("Refusing connection from {:08x}", cx.data.daddr);
            cx.send_dm();
            cx.apply_default_connection_parameters();
            cx.indicate(Indication::Disconnect(Reason::DiscIndication));
            Transition::to(State::Ndm)
        }
        Event::RecvDiscCmd(_) | Event::RecvDmRsp(_) => {
            debug!("{:08x} withdrew its connection request", cx.data.daddr);
            cx.apply_default_connection_parameters();
            cx.indicate(Indication::Disconnect(Reason::DiscIndication));
            Transition::to(State::Ndm)
        }
        Event::RecvXidCmd(_) => {
            debug!("Discovery while connecting, giving up on the connection");
            cx.apply_default_connection_parameters();
            Transition::to(State::Ndm)
        }
        other => Transition::unhandled(State::Conn(c), &other),
    }
}

pub(super) fn setup(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::FinalTimerExpired => {
            if cx.data.retry_count < cx.data.n3 {
                let backoff = Duration::from_millis(cx.data.rng.gen_range(20..50));
                debug!("No answer to SNRM, retrying in {backoff:?}");
                cx.start_timer(TimerKind::Backoff, backoff);
                Transition::to(State::Setup)
            } else {
                info!("No answer from {:08x}", cx.data.daddr);
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::FoundNone));
                Transition::to(State::Ndm)
            }
        }
        Event::BackoffTimerExpired => {
            cx.send_snrm(true);
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            cx.data.retry_count += 1;
            Transition::to(State::Setup)
        }
        Event::RecvSnrmCmd(Snrm {
            info: Some(peer), ..
        }) => {
            // Both sides sent SNRM. The higher address becomes secondary.
            if peer.saddr <= cx.data.saddr {
                debug!("SNRM collision with {:08x}, staying primary", peer.saddr);
                return Transition::to(State::Setup);
            }
            cx.stop_timer(TimerKind::Final);
            cx.stop_timer(TimerKind::Backoff);
            cx.data.daddr = peer.saddr;
            cx.data.caddr = peer.ncaddr;
            match accept(cx, &peer.qos) {
                Some(next) => {
                    info!("SNRM collision with {:08x}, now secondary", peer.saddr);
                    let q = cx.data.qos_tx;
                    cx.indicate(Indication::ConnectConfirm(q));
                    Transition::to(next)
                }
                None => {
                    cx.send_dm();
                    cx.apply_default_connection_parameters();
                    cx.indicate(Indication::Disconnect(Reason::DiscIndication));
                    Transition::to(State::Ndm)
                }
            }
        }
        Event::RecvUaRsp(Ua {
            info: Some(peer), ..
        }) => {
            cx.stop_timer(TimerKind::Final);
            cx.stop_timer(TimerKind::Backoff);
            cx.data.initiate_connection_state();
            if !negotiate(cx, &peer.qos) {
                cx.send_disc();
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::DiscIndication));
                return Transition::to(State::Ndm);
            }
            cx.data.retry_count = 0;
            // Sent at the new speed. Half the final timeout, to find out
            // quickly if the new parameters do not work.
            cx.send_rr(true);
            let t = cx.data.final_timeout / 2;
            cx.start_final_timer(t);
            info!("Connected to {:08x} as primary", cx.data.daddr);
            let q = cx.data.qos_tx;
            cx.indicate(Indication::ConnectConfirm(q));
            Transition::to(State::NrmP { add_wait: false })
        }
        Event::RecvDmRsp(_) | Event::RecvDiscCmd(_) => {
            cx.stop_timer(TimerKind::Final);
            cx.stop_timer(TimerKind::Backoff);
            cx.apply_default_connection_parameters();
            cx.indicate(Indication::Disconnect(Reason::DiscIndication));
            Transition::to(State::Ndm)
        }
        other => Transition::unhandled(State::Setup, &other),
    }
}
