//! Secondary station: NRM_S, XMIT_S, SCLOSE and RESET_CHECK.
//!
//! The secondary never polls. It speaks when handed the floor by a frame
//! with the poll bit, and its watchdog is the only timer it runs.
use log::{debug, info, trace, warn};

use super::{Cx, Event, NrStatus, NsStatus, State, Transition};
use crate::timer::TimerKind;
use crate::{FrameType, Indication, LinkStatus, Reason, Snrm, Test};

fn has_data(cx: &Cx<'_>) -> bool {
    !cx.data.txq.is_empty() && cx.data.window > 0
}

/// Answer the poll with a bare RR and keep listening.
fn yield_floor(cx: &mut Cx<'_>) -> Transition {
    cx.send_rr(false);
    cx.start_wd_timer();
    Transition::to(State::NrmS)
}

/// We were polled and have something to say.
fn take_floor(cx: &mut Cx<'_>) -> Transition {
    cx.stop_timer(TimerKind::Watchdog);
    Transition::to(State::XmitS)
}

/// Peer closed the link with DISC.
fn disconnected(cx: &mut Cx<'_>) -> Transition {
    cx.send_ua(false);
    cx.stop_timer(TimerKind::Watchdog);
    cx.apply_default_connection_parameters();
    info!("Disconnected by {:08x}", cx.data.daddr);
    cx.indicate(Indication::Disconnect(Reason::DiscIndication));
    Transition::to(State::Ndm)
}

fn send_rd(cx: &mut Cx<'_>) -> Transition {
    cx.send_rd();
    cx.start_wd_timer();
    Transition::to(State::Sclose)
}

pub(super) fn nrm(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::RecvICmd(f) => {
            cx.data.retry_count = 0;
            let ns = cx.data.validate_ns(f.ns);
            let nr = cx.data.validate_nr(f.nr);
            trace!("I cmd ns={} nr={} pf={} {ns:?}/{nr:?}", f.ns, f.nr, f.poll);
            match (ns, nr) {
                (_, NrStatus::Invalid) => {
                    warn!("I cmd with invalid nr {} (va={} vs={})", f.nr, cx.data.va, cx.data.vs);
                    cx.start_wd_timer();
                    Transition::to(State::NrmS)
                }
                (NsStatus::Expected, NrStatus::Expected) => {
                    cx.data.next_vr();
                    cx.data.update_nr_received(f.nr);
                    cx.indicate(Indication::Data(f.payload, false));
                    if !f.poll {
                        cx.data.ack_required = true;
                        cx.start_wd_timer();
                        return Transition::to(State::NrmS);
                    }
                    if has_data(cx) {
                        cx.data.ack_required = true;
                        take_floor(cx)
                    } else {
                        yield_floor(cx)
                    }
                }
                (NsStatus::Unexpected, NrStatus::Expected) => {
                    cx.data.update_nr_received(f.nr);
                    if f.poll {
                        yield_floor(cx)
                    } else {
                        cx.start_wd_timer();
                        Transition::to(State::NrmS)
                    }
                }
                (NsStatus::Expected, NrStatus::Unexpected) => {
                    cx.data.next_vr();
                    cx.data.update_nr_received(f.nr);
                    if f.poll {
                        debug!("Frames lost, retransmitting from {}", f.nr);
                        cx.resend_rejected_frames(false);
                    }
                    cx.indicate(Indication::Data(f.payload, false));
                    cx.start_wd_timer();
                    Transition::to(State::NrmS)
                }
                (NsStatus::Unexpected, NrStatus::Unexpected) => {
                    debug!("I cmd out of sequence: ns={} nr={}", f.ns, f.nr);
                    cx.start_wd_timer();
                    Transition::to(State::NrmS)
                }
            }
        }
        Event::RecvUiFrame(f) => {
            cx.indicate(Indication::Data(f.payload, true));
            if !f.poll {
                return Transition::to(State::NrmS);
            }
            if has_data(cx) && !cx.data.remote_busy {
                take_floor(cx)
            } else {
                cx.data.ack_required = false;
                yield_floor(cx)
            }
        }
        Event::RecvRrCmd(s) => {
            cx.data.retry_count = 0;
            match cx.data.validate_nr(s.nr) {
                NrStatus::Expected => {
                    cx.data.remote_busy = false;
                    cx.data.update_nr_received(s.nr);
                    if has_data(cx) {
                        return take_floor(cx);
                    }
                    if cx.data.disconnect_pending {
                        // Idle links never pass through XMIT_S.
                        cx.data.disconnect_pending = false;
                        cx.send_rd();
                        cx.data.flush_all_queues();
                        cx.start_wd_timer();
                        return Transition::to(State::Sclose);
                    }
                    yield_floor(cx)
                }
                NrStatus::Unexpected => {
                    cx.data.remote_busy = false;
                    cx.data.update_nr_received(s.nr);
                    cx.resend_rejected_frames(false);
                    cx.start_wd_timer();
                    Transition::to(State::NrmS)
                }
                NrStatus::Invalid => {
                    warn!("RR cmd with invalid nr {}", s.nr);
                    cx.start_wd_timer();
                    Transition::to(State::NrmS)
                }
            }
        }
        Event::RecvRnrCmd(s) => {
            cx.data.retry_count = 0;
            cx.data.remote_busy = true;
            if cx.data.validate_nr(s.nr) != NrStatus::Invalid {
                cx.data.update_nr_received(s.nr);
            }
            yield_floor(cx)
        }
        Event::RecvRejCmd(s) | Event::RecvSrejCmd(s) if cx.data.remote_busy => {
            cx.data.update_nr_received(s.nr);
            yield_floor(cx)
        }
        Event::RecvRejCmd(s) => {
            cx.data.update_nr_received(s.nr);
            cx.resend_rejected_frames(false);
            cx.start_wd_timer();
            Transition::to(State::NrmS)
        }
        Event::RecvSrejCmd(s) => {
            cx.data.update_nr_received(s.nr);
            cx.resend_rejected_frame(false);
            cx.start_wd_timer();
            Transition::to(State::NrmS)
        }
        Event::RecvSnrmCmd(Snrm { info: None, .. }) => {
            info!("Peer {:08x} is resetting the link", cx.data.daddr);
            cx.stop_timer(TimerKind::Watchdog);
            cx.indicate(Indication::Reset);
            Transition::to(State::ResetCheck)
        }
        Event::WdTimerExpired => {
            // The watchdog runs at twice the final timeout, so half the
            // thresholds.
            if cx.data.retry_count >= cx.data.n2 / 2 {
                info!("Primary {:08x} went silent, giving up", cx.data.daddr);
                cx.apply_default_connection_parameters();
                cx.indicate(Indication::Disconnect(Reason::NoResponse));
                return Transition::to(State::Ndm);
            }
            cx.start_wd_timer();
            cx.data.retry_count += 1;
            let warn_every = cx.data.n1.map(|n1| (n1 / 2).max(1));
            if warn_every.is_some_and(|n| cx.data.retry_count % n == 0) {
                cx.indicate(Indication::Status(LinkStatus::NoActivity));
            }
            Transition::to(State::NrmS)
        }
        Event::RecvDiscCmd(_) => {
            cx.data.flush_all_queues();
            disconnected(cx)
        }
        Event::RecvXidCmd(_) => {
            cx.send_rr(false);
            cx.data.ack_required = true;
            cx.start_wd_timer();
            Transition::to(State::NrmS)
        }
        Event::RecvTestCmd(t) => {
            cx.start_wd_timer();
            let echo = Test {
                poll: t.poll,
                saddr: cx.data.saddr,
                daddr: t.saddr,
                payload: t.payload,
            };
            cx.send(false, FrameType::Test(echo));
            Transition::to(State::NrmS)
        }
        other => Transition::unhandled(State::NrmS, &other),
    }
}

pub(super) fn xmit(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::SendICmd => {
            let Some((out, more)) = cx.next_to_send() else {
                // Hand the floor back; the rest waits for the next poll.
                cx.data.window = cx.data.window_size;
                cx.data.bytes_left = cx.data.line_capacity;
                cx.send_rr(false);
                cx.start_wd_timer();
                return Transition::blocked(State::NrmS);
            };
            if more {
                cx.send_data(out, false);
                Transition::to(State::XmitS)
            } else {
                cx.send_data_secondary_final(out);
                Transition::blocked(State::NrmS)
            }
        }
        Event::DisconnectRequest => {
            cx.data.flush_all_queues();
            send_rd(cx)
        }
        Event::DataRequest => Transition::to(State::XmitS),
        other => Transition::unhandled(State::XmitS, &other),
    }
}

pub(super) fn sclose(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::RecvDiscCmd(_) => disconnected(cx),
        // Any response takes us down.
        Event::RecvDmRsp(_)
        | Event::RecvRrRsp(_)
        | Event::RecvRnrRsp(_)
        | Event::RecvRejRsp(_)
        | Event::RecvSrejRsp(_)
        | Event::RecvIRsp(_)
        | Event::WdTimerExpired => {
            cx.stop_timer(TimerKind::Watchdog);
            cx.apply_default_connection_parameters();
            cx.indicate(Indication::Disconnect(Reason::DiscIndication));
            Transition::to(State::Ndm)
        }
        other if other.poll() == Some(true) => {
            // The primary has not heard our RD yet.
            send_rd(cx)
        }
        other => Transition::unhandled(State::Sclose, &other),
    }
}

pub(super) fn reset_check(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::ResetResponse => {
            cx.send_ua(false);
            cx.data.initiate_connection_state();
            cx.start_wd_timer();
            cx.data.flush_all_queues();
            Transition::to(State::NrmS)
        }
        Event::DisconnectRequest => send_rd(cx),
        other => Transition::unhandled(State::ResetCheck, &other),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{cmd, iframe, rr, rsp, secondary, TestLink};
    use super::*;
    use crate::{Frame, Supervisory, Ua};

    fn responses(l: &mut TestLink) -> Vec<FrameType> {
        let sent = l.device_mut().take();
        assert!(sent.iter().all(|f| !f.command), "{sent:?}");
        sent.into_iter().map(|f| f.frame_type).collect()
    }

    #[test]
    fn data_without_poll() {
        let mut l = secondary();
        let wd = l.timers().token(TimerKind::Watchdog);
        assert!(wd.is_some());
        let f = cmd(&l, FrameType::Iframe(iframe(0, 0, false, b"hi")));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::NrmS);
        // Refreshed, so a long burst does not trip it.
        assert!(l.timers().is_running(TimerKind::Watchdog));
        assert_ne!(l.timers().token(TimerKind::Watchdog), wd);
        assert_eq!(l.data().vr, 1);
        assert!(l.device_mut().take().is_empty());
        assert_eq!(
            l.upper_mut().take(),
            vec![Indication::Data(b"hi".to_vec(), false)]
        );
    }

    #[test]
    fn poll_answered_with_rr() {
        let mut l = secondary();
        let f = cmd(&l, FrameType::Iframe(iframe(0, 0, true, b"hi")));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(
            responses(&mut l),
            vec![FrameType::Rr(Supervisory { poll: true, nr: 1 })]
        );
        assert!(l.timers().is_running(TimerKind::Watchdog));
    }

    #[test]
    fn poll_hands_over_floor() {
        let mut l = secondary();
        for p in [b"a", b"b", b"c"] {
            l.data_request(p.to_vec(), false).unwrap();
        }
        assert!(l.device_mut().take().is_empty());
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::NrmS);
        let got: Vec<_> = responses(&mut l)
            .into_iter()
            .map(|t| match t {
                FrameType::Iframe(i) => (i.ns, i.poll),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(got, vec![(0, false), (1, false), (2, true)]);
        assert!(l.timers().is_running(TimerKind::Watchdog));
        let d = l.data();
        assert_eq!(d.vs, 3);
        assert_eq!(d.window, d.window_size);
    }

    #[test]
    fn acked_by_primary() {
        let mut l = secondary();
        l.data_request(b"a".to_vec(), false).unwrap();
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        l.device_mut().take();
        assert_eq!(l.data().wx_list.len(), 1);
        let f = cmd(&l, FrameType::Rr(rr(1, true)));
        l.receive_frame(f);
        assert!(l.data().wx_list.is_empty());
        assert_eq!(l.data().va, 0);
        assert_eq!(
            responses(&mut l),
            vec![FrameType::Rr(Supervisory { poll: true, nr: 0 })]
        );
    }

    #[test]
    fn unexpected_nr_retransmits() {
        let mut l = secondary();
        for p in [b"a", b"b"] {
            l.data_request(p.to_vec(), false).unwrap();
        }
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        l.device_mut().take();
        // Primary only got the first one.
        let f = cmd(&l, FrameType::Rr(rr(1, true)));
        l.receive_frame(f);
        let got = responses(&mut l);
        assert!(matches!(
            got.as_slice(),
            [FrameType::Iframe(crate::Iframe { ns: 1, poll: true, .. })]
        ));
    }

    #[test]
    fn invalid_nr_only_rearms_watchdog() {
        let mut l = secondary();
        let f = cmd(&l, FrameType::Iframe(iframe(0, 5, true, b"x")));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(l.data().vr, 0);
        assert!(l.device_mut().take().is_empty());
        assert!(l.upper_mut().take().is_empty());
        assert!(l.timers().is_running(TimerKind::Watchdog));
    }

    #[test]
    fn watchdog_exhaustion() {
        let mut l = secondary();
        let limit = l.data().n2 / 2;
        for _ in 0..limit {
            l.expire(TimerKind::Watchdog);
            assert_eq!(l.state(), &State::NrmS);
        }
        l.expire(TimerKind::Watchdog);
        assert_eq!(l.state(), &State::Ndm);
        let ups = l.upper_mut().take();
        assert_eq!(
            ups.last(),
            Some(&Indication::Disconnect(Reason::NoResponse))
        );
        let warnings = ups
            .iter()
            .filter(|i| matches!(i, Indication::Status(LinkStatus::NoActivity)))
            .count();
        // N1=6, N2=24 at the default parameters: a warning every 3rd of 12.
        assert_eq!(warnings, 4);
    }

    #[test]
    fn disc_answered_with_ua() {
        let mut l = secondary();
        let f = cmd(&l, FrameType::Disc(true));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Ndm);
        assert!(matches!(
            responses(&mut l).as_slice(),
            [FrameType::Ua(Ua { info: None, .. })]
        ));
        assert!(!l.timers().is_running(TimerKind::Watchdog));
        assert_eq!(
            l.upper_mut().take(),
            vec![Indication::Disconnect(Reason::DiscIndication)]
        );
        assert_eq!(l.device_mut().speed, Some(9600));
    }

    #[test]
    fn reset_handshake() {
        let mut l = secondary();
        l.data_mut().vr = 4;
        let f = cmd(
            &l,
            FrameType::Snrm(Snrm {
                poll: true,
                info: None,
            }),
        );
        l.receive_frame(f);
        assert_eq!(l.state(), &State::ResetCheck);
        assert!(!l.timers().is_running(TimerKind::Watchdog));
        assert_eq!(l.upper_mut().take(), vec![Indication::Reset]);
        l.reset_response();
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(l.data().vr, 0);
        assert!(matches!(
            responses(&mut l).as_slice(),
            [FrameType::Ua(_)]
        ));
        assert!(l.timers().is_running(TimerKind::Watchdog));
    }

    #[test]
    fn reset_refused() {
        let mut l = secondary();
        let f = cmd(
            &l,
            FrameType::Snrm(Snrm {
                poll: true,
                info: None,
            }),
        );
        l.receive_frame(f);
        l.disconnect_request();
        assert_eq!(l.state(), &State::Sclose);
        assert_eq!(responses(&mut l), vec![FrameType::Rd(true)]);
    }

    #[test]
    fn deferred_disconnect_on_idle_poll() {
        let mut l = secondary();
        l.disconnect_request();
        assert_eq!(l.state(), &State::NrmS);
        assert!(l.device_mut().take().is_empty());
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Sclose);
        assert_eq!(responses(&mut l), vec![FrameType::Rd(true)]);

        // Poll again: primary missed the RD.
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Sclose);
        assert_eq!(responses(&mut l), vec![FrameType::Rd(true)]);

        let f = cmd(&l, FrameType::Disc(true));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Ndm);
        assert_eq!(
            l.upper_mut().take(),
            vec![Indication::Disconnect(Reason::DiscIndication)]
        );
    }

    #[test]
    fn sclose_watchdog() {
        let mut l = secondary();
        l.disconnect_request();
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        l.expire(TimerKind::Watchdog);
        assert_eq!(l.state(), &State::Ndm);
    }

    #[test]
    fn sclose_any_response() {
        let mut l = secondary();
        l.disconnect_request();
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        let f = rsp(&l, FrameType::Dm(true));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::Ndm);
    }

    #[test]
    fn busy_primary() {
        let mut l = secondary();
        l.data_request(b"a".to_vec(), false).unwrap();
        let f = cmd(&l, FrameType::Rnr(rr(0, true)));
        l.receive_frame(f);
        assert!(l.data().remote_busy);
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(
            responses(&mut l),
            vec![FrameType::Rr(Supervisory { poll: true, nr: 0 })]
        );
        assert_eq!(l.data().txq.len(), 1);
    }

    #[test]
    fn byte_budget_hands_floor_back() {
        let mut l = secondary();
        l.data_mut().bytes_left = 10;
        l.data_request(vec![0; 20], false).unwrap();
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        assert_eq!(l.state(), &State::NrmS);
        assert_eq!(
            responses(&mut l),
            vec![FrameType::Rr(Supervisory { poll: true, nr: 0 })]
        );
        assert_eq!(l.data().txq.len(), 1);
        assert_eq!(l.data().bytes_left, l.data().line_capacity);
    }

    #[test]
    fn test_frame_echoed() {
        let mut l = secondary();
        let f = cmd(
            &l,
            FrameType::Test(Test {
                poll: true,
                saddr: super::super::tests::PEER,
                daddr: super::super::tests::ME,
                payload: b"echo".to_vec(),
            }),
        );
        l.receive_frame(f);
        let got = responses(&mut l);
        assert!(matches!(
            got.as_slice(),
            [FrameType::Test(Test { payload, .. })] if payload == b"echo"
        ));
    }

    #[test]
    fn frames_keep_connection_address() {
        let mut l = secondary();
        let f = cmd(&l, FrameType::Rr(rr(0, true)));
        l.receive_frame(f);
        let sent = l.device_mut().take();
        assert!(matches!(sent.as_slice(), [Frame { caddr: 0x42, .. }]));
    }
}
