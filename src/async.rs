//! Tokio runner for a link.
//!
//! The link itself is synchronous. This module gives it a task of its own:
//! frames come and go as byte vectors over channels, requests come in on a
//! channel, and indications go out on another.
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::{Config, Link};
use crate::qos::Qos;
use crate::{
    Device, Discovery, DiscoveryLog, Frame, Indication, LinkStatus, Reason, SnrmInfo, Upper,
};

/// How long the medium counts as busy after hearing a frame.
const MEDIA_BUSY_HOLD: Duration = Duration::from_millis(20);

/// Wake up at least this often when no timer is running.
const IDLE: Duration = Duration::from_secs(3600);

/// Requests from the layer above.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Discovery(u8),
    Connect(u32),
    ConnectResponse,
    Disconnect,
    Data(Vec<u8>, bool),
    Unitdata(Vec<u8>),
    Reset,
    ResetResponse,
}

/// Device writing serialized frames to a channel.
pub struct ChannelDevice {
    out: mpsc::Sender<Vec<u8>>,
    heard: Option<Instant>,
    speed: u32,
}

impl ChannelDevice {
    #[must_use]
    pub fn new(out: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            out,
            heard: None,
            speed: 9600,
        }
    }

    /// Something was received just now.
    pub fn heard(&mut self) {
        self.heard = Some(Instant::now());
    }
}

impl Device for ChannelDevice {
    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.out
            .try_send(frame.serialize())
            .map_err(|e| Error::msg(format!("frame channel: {e}")))
    }
    fn is_media_busy(&self) -> bool {
        self.heard.is_some_and(|t| t.elapsed() < MEDIA_BUSY_HOLD)
    }
    fn is_receiving(&self) -> bool {
        // Frames only arrive whole.
        false
    }
    fn change_speed(&mut self, baud_rate: u32) {
        debug!("Speed {} -> {baud_rate}", self.speed);
        self.speed = baud_rate;
    }
}

/// Upper layer forwarding every indication to a channel.
pub struct ChannelUpper {
    tx: mpsc::UnboundedSender<Indication>,
}

impl ChannelUpper {
    fn push(&mut self, ind: Indication) {
        if self.tx.send(ind).is_err() {
            debug!("Nobody listening for indications");
        }
    }
}

impl Upper for ChannelUpper {
    fn connect_indication(&mut self, info: &SnrmInfo) {
        self.push(Indication::Connect(info.clone()));
    }
    fn connect_confirm(&mut self, qos_tx: &Qos) {
        self.push(Indication::ConnectConfirm(*qos_tx));
    }
    fn disconnect_indication(&mut self, reason: Reason) {
        self.push(Indication::Disconnect(reason));
    }
    fn data_indication(&mut self, data: Vec<u8>, unreliable: bool) {
        self.push(Indication::Data(data, unreliable));
    }
    fn unitdata_indication(&mut self, data: Vec<u8>) {
        self.push(Indication::Unitdata(data));
    }
    fn discovery_indication(&mut self, discovery: Discovery) {
        self.push(Indication::Discovery(discovery));
    }
    fn discovery_confirm(&mut self, log: Option<DiscoveryLog>) {
        self.push(Indication::DiscoveryConfirm(log));
    }
    fn reset_indication(&mut self) {
        self.push(Indication::Reset);
    }
    fn reset_confirm(&mut self) {
        self.push(Indication::ResetConfirm);
    }
    fn status_indication(&mut self, status: LinkStatus) {
        self.push(Indication::Status(status));
    }
}

pub type ChannelLink = Link<ChannelDevice, ChannelUpper>;

/// The caller's end of a running link.
pub struct Handle {
    requests: mpsc::Sender<Request>,
    indications: mpsc::UnboundedReceiver<Indication>,
    task: JoinHandle<Result<()>>,
}

impl Handle {
    pub async fn request(&self, req: Request) -> Result<()> {
        self.requests
            .send(req)
            .await
            .map_err(|_| Error::msg("link task has ended"))
    }

    /// Next indication, or `None` once the link task is gone.
    pub async fn indication(&mut self) -> Option<Indication> {
        self.indications.recv().await
    }

    /// Skip indications until one matches.
    pub async fn wait_for<F>(&mut self, mut want: F) -> Result<Indication>
    where
        F: FnMut(&Indication) -> bool,
    {
        loop {
            let ind = self
                .indication()
                .await
                .ok_or(Error::msg("link task has ended"))?;
            if want(&ind) {
                return Ok(ind);
            }
            debug!("Skipping {ind:?}");
        }
    }

    /// Stop taking requests and wait for the task to finish.
    pub async fn close(self) -> Result<()> {
        let Handle { requests, task, .. } = self;
        drop(requests);
        task.await?
    }
}

/// Start a link task reading frames from `frames_in` and writing them to
/// `frames_out`.
pub fn spawn(
    config: Config,
    frames_in: mpsc::Receiver<Vec<u8>>,
    frames_out: mpsc::Sender<Vec<u8>>,
) -> Handle {
    let (req_tx, req_rx) = mpsc::channel(10);
    let (ind_tx, ind_rx) = mpsc::unbounded_channel();
    let link = Link::new(
        config,
        ChannelDevice::new(frames_out),
        ChannelUpper { tx: ind_tx },
    );
    let task = tokio::spawn(run(link, frames_in, req_rx));
    Handle {
        requests: req_tx,
        indications: ind_rx,
        task,
    }
}

fn apply(link: &mut ChannelLink, req: Request) {
    debug!("Request {req:?}");
    match req {
        Request::Discovery(slots) => {
            if let Err(e) = link.discovery_request(slots) {
                warn!("Discovery request failed: {e}");
            }
        }
        Request::Connect(daddr) => link.connect_request(daddr),
        Request::ConnectResponse => link.connect_response(),
        Request::Disconnect => link.disconnect_request(),
        Request::Data(data, unreliable) => {
            if let Err(e) = link.data_request(data, unreliable) {
                warn!("Data request refused: {e}");
            }
        }
        Request::Unitdata(data) => link.unitdata_request(data),
        Request::Reset => link.reset_request(),
        Request::ResetResponse => link.reset_response(),
    }
}

/// Drive a link until either input channel closes.
pub async fn run(
    mut link: ChannelLink,
    mut frames_in: mpsc::Receiver<Vec<u8>>,
    mut requests: mpsc::Receiver<Request>,
) -> Result<()> {
    loop {
        let deadline = link
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE);
        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(sleep);
        tokio::select! {
            () = &mut sleep => link.poll_timers(Instant::now()),
            frame = frames_in.recv() => {
                let Some(bytes) = frame else {
                    debug!("Frame source closed");
                    return Ok(());
                };
                link.device_mut().heard();
                if let Err(e) = link.receive(&bytes) {
                    debug!("Dropping bad frame: {e:?}");
                }
            },
            req = requests.recv() => {
                let Some(req) = req else {
                    debug!("Request channel closed");
                    return Ok(());
                };
                apply(&mut link, req);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(saddr: u32) -> Config {
        Config {
            saddr,
            seed: Some(u64::from(saddr)),
            ..Config::default()
        }
    }

    /// Two links wired back to back.
    fn pair() -> (Handle, Handle) {
        let (a_out, b_in) = mpsc::channel(32);
        let (b_out, a_in) = mpsc::channel(32);
        (
            spawn(config(0x0a0a_0a0a), a_in, a_out),
            spawn(config(0x0b0b_0b0b), b_in, b_out),
        )
    }

    #[tokio::test]
    async fn connect_send_disconnect() -> Result<()> {
        let (mut a, mut b) = pair();
        let done = tokio::time::timeout(Duration::from_secs(10), async {
            a.request(Request::Connect(0x0b0b_0b0b)).await?;
            let ind = b
                .wait_for(|i| matches!(i, Indication::Connect(_)))
                .await?;
            assert!(matches!(ind, Indication::Connect(SnrmInfo { saddr: 0x0a0a_0a0a, .. })));
            b.request(Request::ConnectResponse).await?;
            a.wait_for(|i| matches!(i, Indication::ConnectConfirm(_)))
                .await?;

            a.request(Request::Data(b"ping".to_vec(), false)).await?;
            let ind = b.wait_for(|i| matches!(i, Indication::Data(..))).await?;
            assert_eq!(ind, Indication::Data(b"ping".to_vec(), false));

            // The answer waits for the next poll.
            b.request(Request::Data(b"pong".to_vec(), false)).await?;
            let ind = a.wait_for(|i| matches!(i, Indication::Data(..))).await?;
            assert_eq!(ind, Indication::Data(b"pong".to_vec(), false));

            a.request(Request::Disconnect).await?;
            let ind = b
                .wait_for(|i| matches!(i, Indication::Disconnect(_)))
                .await?;
            assert_eq!(ind, Indication::Disconnect(Reason::DiscIndication));
            a.wait_for(|i| matches!(i, Indication::Disconnect(_)))
                .await?;
            Ok::<(), Error>(())
        })
        .await;
        done??;
        a.close().await?;
        b.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn discovery_over_channels() -> Result<()> {
        let (mut a, b) = pair();
        a.request(Request::Discovery(6)).await?;
        let ind = tokio::time::timeout(
            Duration::from_secs(10),
            a.wait_for(|i| matches!(i, Indication::DiscoveryConfirm(_))),
        )
        .await??;
        let Indication::DiscoveryConfirm(Some(log)) = ind else {
            panic!("unexpected {ind:?}");
        };
        assert!(log.get(0x0b0b_0b0b).is_some());
        a.close().await?;
        b.close().await?;
        Ok(())
    }
}
