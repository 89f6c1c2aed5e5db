//! Link reset, primary side: RESET_WAIT and RESET.
//!
//! A sequence fault or FRMR puts the primary in RESET_WAIT and tells the
//! upper layer, which answers with `reset_request` (or tears the link down).
use log::{debug, info};

use super::{Cx, Event, State, Transition};
use crate::timer::TimerKind;
use crate::{Indication, Reason, Snrm};

/// SNRM retransmissions before we only wait for the peer.
const RESET_SNRM_RETRIES: u32 = 3;

/// Sequence numbers no longer make sense. `xmitflag` says whether we are
/// the one to send the reset SNRM.
pub(super) fn protocol_fault(cx: &mut Cx<'_>, xmitflag: bool) -> Transition {
    cx.stop_timer(TimerKind::Final);
    cx.indicate(Indication::Reset);
    Transition::to(State::ResetWait { xmitflag })
}

pub(super) fn reset_wait(cx: &mut Cx<'_>, xmitflag: bool, event: Event) -> Transition {
    match event {
        Event::ResetRequest => {
            cx.data.retry_count = 0;
            if xmitflag {
                cx.send_snrm(false);
            }
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            Transition::to(State::Reset)
        }
        Event::DisconnectRequest => {
            cx.send_disc();
            cx.data.flush_all_queues();
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            cx.data.retry_count = 0;
            Transition::to(State::Pclose)
        }
        other => Transition::unhandled(State::ResetWait { xmitflag }, &other),
    }
}

pub(super) fn reset(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::RecvDiscCmd(_) => {
            cx.stop_timer(TimerKind::Final);
            cx.apply_default_connection_parameters();
            cx.indicate(Indication::Disconnect(Reason::ResetIndication));
            Transition::to(State::Ndm)
        }
        Event::RecvUaRsp(_) => {
            cx.stop_timer(TimerKind::Final);
            cx.data.initiate_connection_state();
            info!("Link to {:08x} reset", cx.data.daddr);
            cx.indicate(Indication::ResetConfirm);
            cx.data.remote_busy = false;
            cx.start_poll_timer();
            Transition::to(State::XmitP)
        }
        Event::FinalTimerExpired => {
            let retry = cx.data.retry_count;
            if retry >= cx.data.n3.max(RESET_SNRM_RETRIES) {
                info!("Reset of link to {:08x} failed", cx.data.daddr);
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::ResetIndication));
                return Transition::to(State::Ndm);
            }
            if retry < RESET_SNRM_RETRIES {
                cx.send_snrm(false);
            }
            cx.data.retry_count += 1;
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            Transition::to(State::Reset)
        }
        Event::RecvSnrmCmd(Snrm { info: None, .. }) => {
            // Both ends reset at once. Acknowledge, then drop back to idle
            // rather than guess who is primary.
            debug!("Peer is resetting too");
            cx.stop_timer(TimerKind::Final);
            cx.data.initiate_connection_state();
            cx.send_ua(false);
            cx.indicate(Indication::ResetConfirm);
            cx.start_wd_timer();
            cx.apply_default_connection_parameters();
            Transition::to(State::Ndm)
        }
        other => Transition::unhandled(State::Reset, &other),
    }
}
