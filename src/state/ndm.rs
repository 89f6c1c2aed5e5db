//! Disconnected mode and discovery.
use std::time::Duration;

use log::{debug, info};

use super::{Conn, Cx, Event, Query, Reply, State, Transition, MEDIABUSY_TIMEOUT};
use crate::discovery::{self, FINAL_SLOT};
use crate::timer::TimerKind;
use crate::{
    Discovery, DiscoveryLog, FrameType, Indication, Reason, Snrm, Test, Xid, DEV_BROADCAST,
};

const IRLAP_VERSION: u8 = 0x00;

/// UI frames sent per media-idle period in NDM.
const ULTRA_BURST: usize = 2;

/// How long to keep listening when a frame is on its way in at slot end.
const ADD_WAIT: Duration = Duration::from_millis(10);

/// Send a discovery XID. Our identity goes in the final command and in
/// responses.
fn send_xid(cx: &mut Cx<'_>, command: bool, daddr: u32, slots: u8, slot: u8) {
    let cfg = &cx.data.config;
    let discovery = (!command || slot == FINAL_SLOT).then(|| Discovery {
        daddr: cx.data.saddr,
        saddr: daddr,
        hints: cfg.hints,
        charset: cfg.charset,
        nickname: cfg.nickname.clone(),
    });
    let xid = Xid {
        saddr: cx.data.saddr,
        daddr,
        slots,
        slot,
        version: IRLAP_VERSION,
        discovery,
    };
    cx.send_broadcast(command, FrameType::Xid(xid));
}

fn send_ultra(cx: &mut Cx<'_>) {
    while cx.data.ultra_sent < ULTRA_BURST && !cx.media_busy() {
        let Some(payload) = cx.data.txq_ultra.pop_front() else {
            return;
        };
        cx.send_broadcast(
            true,
            FrameType::Ui(crate::Ui {
                poll: false,
                payload,
            }),
        );
        cx.data.ultra_sent += 1;
        if cx.data.ultra_sent == ULTRA_BURST {
            // Listen for a while before using the medium again.
            cx.start_timer(TimerKind::MediaBusy, MEDIABUSY_TIMEOUT);
        }
    }
    if cx.media_busy() && !cx.data.txq_ultra.is_empty() {
        cx.start_timer(TimerKind::MediaBusy, MEDIABUSY_TIMEOUT);
    }
}

pub(super) fn ndm(cx: &mut Cx<'_>, event: Event) -> Transition {
    match event {
        Event::ConnectRequest { daddr } => {
            if cx.media_busy() {
                info!("Media busy, connection to {daddr:08x} not attempted");
                cx.indicate(Indication::Disconnect(Reason::MediaBusy));
                return Transition::to(State::Ndm);
            }
            cx.data.daddr = daddr;
            cx.data.retry_count = 0;
            cx.send_snrm(true);
            let t = cx.data.final_timeout;
            cx.start_final_timer(t);
            Transition::to(State::Setup)
        }
        Event::RecvSnrmCmd(Snrm {
            info: Some(peer), ..
        }) if peer.daddr == cx.data.saddr => {
            debug!("Connection request from {:08x}", peer.saddr);
            cx.data.daddr = peer.saddr;
            cx.data.caddr = peer.ncaddr;
            cx.indicate(Indication::Connect(peer.clone()));
            Transition::to(State::Conn(Conn { peer }))
        }
        Event::DiscoveryRequest { slots } => {
            if cx.media_busy() {
                info!("Media busy, discovery not started");
                cx.indicate(Indication::DiscoveryConfirm(None));
                return Transition::to(State::Ndm);
            }
            send_xid(cx, true, DEV_BROADCAST, slots, 0);
            let t = cx.data.slot_timeout;
            cx.start_timer(TimerKind::Slot, t);
            Transition::to(State::Query(Query {
                slots,
                s: 1,
                add_wait: false,
                log: DiscoveryLog::new(),
            }))
        }
        Event::RecvXidCmd(x) => {
            if x.slot == FINAL_SLOT {
                // Someone finished a discovery; they told us who they are.
                if let Some(d) = x.discovery {
                    cx.indicate(Indication::Discovery(d));
                }
                return Transition::to(State::Ndm);
            }
            let slot = discovery::random_slot(x.slots, x.slot, &mut cx.data.rng);
            let frame_sent = slot == x.slot;
            if frame_sent {
                send_xid(cx, false, x.saddr, x.slots, slot);
            }
            cx.start_timer(
                TimerKind::Query,
                discovery::query_timeout(x.slots, x.slot, cx.data.slot_timeout),
            );
            Transition::to(State::Reply(Reply { slot, frame_sent }))
        }
        Event::RecvUiFrame(ui) => {
            cx.indicate(Indication::Unitdata(ui.payload));
            Transition::to(State::Ndm)
        }
        Event::RecvTestCmd(t) if t.daddr == cx.data.saddr || t.daddr == DEV_BROADCAST => {
            let echo = Test {
                poll: t.poll,
                saddr: cx.data.saddr,
                daddr: t.saddr,
                payload: t.payload,
            };
            cx.send_broadcast(false, FrameType::Test(echo));
            Transition::to(State::Ndm)
        }
        Event::SendUiFrame => {
            send_ultra(cx);
            Transition::to(State::Ndm)
        }
        Event::MediaBusyTimerExpired => {
            cx.data.ultra_sent = 0;
            if !cx.data.txq_ultra.is_empty() {
                cx.follow_up(Event::SendUiFrame);
            }
            Transition::to(State::Ndm)
        }
        other => Transition::unhandled(State::Ndm, &other),
    }
}

pub(super) fn query(cx: &mut Cx<'_>, mut q: Query, event: Event) -> Transition {
    match event {
        Event::RecvXidRsp(x) => {
            if let Some(d) = x.discovery {
                debug!("Discovered {:08x} {:?}", d.daddr, d.nickname);
                q.log.insert(d);
            }
            Transition::to(State::Query(q))
        }
        Event::RecvXidCmd(x) => {
            // Another station discovering at the same time.
            if x.slot == FINAL_SLOT {
                if let Some(d) = x.discovery {
                    cx.indicate(Indication::Discovery(d));
                }
            }
            Transition::to(State::Query(q))
        }
        Event::SlotTimerExpired => {
            if cx.receiving() && !q.add_wait {
                debug!("Frame on its way in, waiting a little longer");
                q.add_wait = true;
                cx.start_timer(TimerKind::Slot, ADD_WAIT);
                return Transition::to(State::Query(q));
            }
            q.add_wait = false;
            if q.s < q.slots {
                send_xid(cx, true, DEV_BROADCAST, q.slots, q.s);
                q.s += 1;
                let t = cx.data.slot_timeout;
                cx.start_timer(TimerKind::Slot, t);
                Transition::to(State::Query(q))
            } else {
                send_xid(cx, true, DEV_BROADCAST, q.slots, FINAL_SLOT);
                info!("Discovery done, {} device(s) found", q.log.len());
                cx.indicate(Indication::DiscoveryConfirm(Some(q.log)));
                Transition::to(State::Ndm)
            }
        }
        other => Transition::unhandled(State::Query(q), &other),
    }
}

pub(super) fn reply(cx: &mut Cx<'_>, mut r: Reply, event: Event) -> Transition {
    match event {
        Event::QueryTimerExpired => {
            debug!("Discovery by peer timed out");
            Transition::to(State::Ndm)
        }
        Event::RecvXidCmd(x) => {
            if x.slot == FINAL_SLOT {
                cx.stop_timer(TimerKind::Query);
                if let Some(d) = x.discovery {
                    cx.indicate(Indication::Discovery(d));
                }
                return Transition::to(State::Ndm);
            }
            if x.slot >= r.slot && !r.frame_sent {
                send_xid(cx, false, x.saddr, x.slots, r.slot);
                r.frame_sent = true;
            }
            cx.start_timer(
                TimerKind::Query,
                discovery::query_timeout(x.slots, x.slot, cx.data.slot_timeout),
            );
            Transition::to(State::Reply(r))
        }
        other => Transition::unhandled(State::Reply(r), &other),
    }
}
