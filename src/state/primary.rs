//! Primary station: XMIT_P, NRM_P and PCLOSE.
use std::time::Duration;

use log::{debug, info, trace};

use super::reset::protocol_fault;
use super::{Cx, Event, NrStatus, NsStatus, State, Transition};
use crate::timer::TimerKind;
use crate::{Indication, LinkStatus, Reason};

/// Extra wait when the final timer fires in the middle of an incoming frame.
const ADD_WAIT: Duration = Duration::from_millis(300);

fn nrm_p() -> State {
    State::NrmP { add_wait: false }
}

/// Our turn again: back to XMIT_P with the poll timer running.
fn take_floor(cx: &mut Cx<'_>) -> Transition {
    cx.start_poll_timer();
    Transition::to(State::XmitP)
}

/// REJ (go back N) or SREJ (just the one frame).
fn reject(cx: &mut Cx<'_>, nr: u8, selective: bool, add_wait: bool) -> Transition {
    cx.data.update_nr_received(nr);
    if cx.data.remote_busy {
        cx.send_rr(true);
    } else if selective {
        cx.resend_rejected_frame(true);
    } else {
        cx.resend_rejected_frames(true);
    }
    let t = cx.data.final_timeout * 2;
    cx.start_final_timer(t);
    Transition::to(State::NrmP { add_wait })
}

pub(super) fn xmit(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::SendICmd => {
            let Some((out, more)) = cx.next_to_send() else {
                return Transition::blocked(State::XmitP);
            };
            // Peer may want to answer right away.
            cx.data.fast_rr = None;
            if more {
                cx.send_data(out, true);
                Transition::to(State::XmitP)
            } else {
                cx.send_data_primary_poll(out);
                Transition::blocked(nrm_p())
            }
        }
        Event::PollTimerExpired => {
            cx.send_rr(true);
            cx.data.window = cx.data.window_size;
            cx.data.bytes_left = cx.data.line_capacity;
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            Transition::to(nrm_p())
        }
        Event::DisconnectRequest => {
            cx.stop_timer(TimerKind::Poll);
            cx.send_disc();
            cx.data.flush_all_queues();
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            cx.data.retry_count = 0;
            Transition::to(State::Pclose)
        }
        // Queued data goes out from the drain loop.
        Event::DataRequest => Transition::to(State::XmitP),
        other => Transition::unhandled(State::XmitP, &other),
    }
}

pub(super) fn nrm(cx: &mut Cx<'_>, add_wait: bool, event: Event) -> Transition {
    match event {
        Event::RecvIRsp(f) => {
            cx.data.fast_rr = None;
            let ns = cx.data.validate_ns(f.ns);
            let nr = cx.data.validate_nr(f.nr);
            trace!("I rsp ns={} nr={} pf={} {ns:?}/{nr:?}", f.ns, f.nr, f.poll);
            match (ns, nr) {
                (_, NrStatus::Invalid) => {
                    debug!("Invalid nr {} (va={} vs={})", f.nr, cx.data.va, cx.data.vs);
                    protocol_fault(cx, f.poll)
                }
                (NsStatus::Expected, NrStatus::Expected) => {
                    cx.data.next_vr();
                    cx.data.update_nr_received(f.nr);
                    cx.data.ack_required = true;
                    cx.data.retry_count = 0;
                    if !f.poll {
                        cx.indicate(Indication::Data(f.payload, false));
                        return Transition::to(nrm_p());
                    }
                    cx.stop_timer(TimerKind::Final);
                    cx.indicate(Indication::Data(f.payload, false));
                    take_floor(cx)
                }
                (NsStatus::Unexpected, NrStatus::Expected) => {
                    cx.data.update_nr_received(f.nr);
                    if f.poll {
                        // Discard, and tell the peer what we have.
                        cx.send_rr(true);
                        cx.data.ack_required = false;
                        let t = cx.data.final_timeout;
                        cx.start_final_timer(t);
                    }
                    Transition::to(nrm_p())
                }
                (NsStatus::Expected, NrStatus::Unexpected) => {
                    cx.data.next_vr();
                    cx.data.update_nr_received(f.nr);
                    cx.data.ack_required = false;
                    if f.poll {
                        cx.resend_rejected_frames(true);
                        let t = cx.data.final_timeout * 2;
                        cx.start_final_timer(t);
                    }
                    cx.indicate(Indication::Data(f.payload, false));
                    Transition::to(nrm_p())
                }
                (NsStatus::Unexpected, NrStatus::Unexpected) => {
                    if f.poll {
                        cx.resend_rejected_frames(true);
                        let t = cx.data.final_timeout * 2;
                        cx.start_final_timer(t);
                    }
                    Transition::to(nrm_p())
                }
            }
        }
        Event::RecvUiFrame(f) => {
            cx.indicate(Indication::Data(f.payload, true));
            if f.poll {
                cx.stop_timer(TimerKind::Final);
                take_floor(cx)
            } else {
                Transition::to(State::NrmP { add_wait })
            }
        }
        Event::RecvRrRsp(s) => {
            // Whatever the nr, the peer is no longer busy.
            cx.data.remote_busy = false;
            cx.stop_timer(TimerKind::Final);
            match cx.data.validate_nr(s.nr) {
                NrStatus::Expected => {
                    cx.data.update_nr_received(s.nr);
                    cx.data.retry_count = 0;
                    take_floor(cx)
                }
                NrStatus::Unexpected => {
                    cx.data.update_nr_received(s.nr);
                    debug!(
                        "RR with unexpected nr={} va={} vs={}, retransmitting",
                        s.nr, cx.data.va, cx.data.vs
                    );
                    cx.data.retry_count = 0;
                    cx.resend_rejected_frames(true);
                    let t = cx.data.final_timeout * 2;
                    cx.start_final_timer(t);
                    Transition::to(nrm_p())
                }
                NrStatus::Invalid => {
                    debug!("RR with invalid nr {}", s.nr);
                    protocol_fault(cx, true)
                }
            }
        }
        Event::RecvRnrRsp(s) => {
            cx.stop_timer(TimerKind::Final);
            cx.data.remote_busy = true;
            cx.data.update_nr_received(s.nr);
            take_floor(cx)
        }
        Event::RecvRejRsp(s) => reject(cx, s.nr, false, add_wait),
        Event::RecvSrejRsp(s) => reject(cx, s.nr, true, add_wait),
        Event::RecvFrmrRsp(_) => {
            info!("Frame reject from {:08x}", cx.data.daddr);
            protocol_fault(cx, true)
        }
        Event::FinalTimerExpired => {
            if cx.receiving() && !add_wait {
                debug!("Final timer expired while receiving, waiting a little more");
                cx.start_final_timer(ADD_WAIT);
                return Transition::to(State::NrmP { add_wait: true });
            }
            if cx.data.retry_count >= cx.data.n2 {
                info!("No response from {:08x}, giving up", cx.data.daddr);
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::NoResponse));
                return Transition::to(State::Ndm);
            }
            if cx.data.wx_list.is_empty() {
                cx.send_rr(true);
            } else {
                cx.resend_rejected_frames(true);
            }
            let t = cx.data.final_timeout * 2;
            cx.start_final_timer(t);
            cx.data.retry_count += 1;
            debug!("Final timer expired, retry {}", cx.data.retry_count);
            if cx.data.n1.is_some_and(|n1| cx.data.retry_count % n1 == 0) {
                cx.indicate(Indication::Status(LinkStatus::NoActivity));
            }
            Transition::to(nrm_p())
        }
        Event::RecvRdRsp(_) => {
            // The peer wants to close. Do it properly from XMIT_P.
            debug!("RD from {:08x}", cx.data.daddr);
            cx.data.flush_all_queues();
            cx.follow_up(Event::DisconnectRequest);
            Transition::to(State::XmitP)
        }
        other => Transition::unhandled(State::NrmP { add_wait }, &other),
    }
}

pub(super) fn pclose(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::RecvUaRsp(_) | Event::RecvDmRsp(_) => {
            cx.stop_timer(TimerKind::Final);
            cx.apply_default_connection_parameters();
            info!("Disconnected from {:08x}", cx.data.daddr);
            cx.indicate(Indication::Disconnect(Reason::DiscIndication));
            Transition::to(State::Ndm)
        }
        Event::FinalTimerExpired => {
            if cx.data.retry_count < cx.data.n3 {
                cx.send_disc();
                let t = cx.data.final_timeout;
                cx.start_final_timer(t);
                cx.data.retry_count += 1;
                Transition::to(State::Pclose)
            } else {
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::NoResponse));
                Transition::to(State::Ndm)
            }
        }
        other => Transition::unhandled(State::Pclose, &other),
    }
}
