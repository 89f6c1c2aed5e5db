//! Two links talking to each other over in-memory channels.
//!
//! Station A discovers, connects to whatever it found, sends each message,
//! waits for it to be echoed back, and disconnects.
use anyhow::{Error, Result};
use clap::Parser;
use tokio::sync::mpsc;

use irlap::r#async::{spawn, Request};
use irlap::{Config, Indication};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'v', default_value = "0")]
    v: usize,

    /// Discovery slots: 1, 6, 8 or 16.
    #[clap(short = 'n', default_value = "6")]
    slots: u8,

    /// Poll faster while idle, growing by this many milliseconds.
    #[clap(long)]
    fast_rr: Option<u64>,

    #[clap(default_value = "hello")]
    messages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("irlap")
        .verbosity(opt.v)
        .init()
        .unwrap();

    let (a_out, b_in) = mpsc::channel(32);
    let (b_out, a_in) = mpsc::channel(32);
    let mut a = spawn(
        Config {
            nickname: "alpha".into(),
            fast_rr: opt.fast_rr.map(std::time::Duration::from_millis),
            ..Config::default()
        },
        a_in,
        a_out,
    );
    let mut b = spawn(
        Config {
            nickname: "bravo".into(),
            ..Config::default()
        },
        b_in,
        b_out,
    );

    // B accepts every connection and echoes what it gets.
    let echo = tokio::spawn(async move {
        while let Some(ind) = b.indication().await {
            eprintln!("B: {ind:?}");
            match ind {
                Indication::Connect(_) => b.request(Request::ConnectResponse).await?,
                Indication::Data(data, unreliable) => {
                    b.request(Request::Data(data, unreliable)).await?
                }
                Indication::Disconnect(_) => break,
                _ => {}
            }
        }
        b.close().await
    });

    a.request(Request::Discovery(opt.slots)).await?;
    let found = match a
        .wait_for(|i| matches!(i, Indication::DiscoveryConfirm(_)))
        .await?
    {
        Indication::DiscoveryConfirm(Some(log)) => log,
        _ => return Err(Error::msg("discovery did not run")),
    };
    let peer = found
        .iter()
        .next()
        .ok_or(Error::msg("nobody discovered"))?;
    println!("Found {:08x} {:?}", peer.daddr, peer.nickname);

    a.request(Request::Connect(peer.daddr)).await?;
    match a
        .wait_for(|i| matches!(i, Indication::ConnectConfirm(_) | Indication::Disconnect(_)))
        .await?
    {
        Indication::ConnectConfirm(qos) => println!("Connected at {} bps", qos.baud_rate),
        other => return Err(Error::msg(format!("connect failed: {other:?}"))),
    }

    for msg in &opt.messages {
        a.request(Request::Data(msg.as_bytes().to_vec(), false))
            .await?;
        match a.wait_for(|i| matches!(i, Indication::Data(..))).await? {
            Indication::Data(data, _) => println!("Echo: {}", String::from_utf8_lossy(&data)),
            other => unreachable!("{other:?}"),
        }
    }

    a.request(Request::Disconnect).await?;
    a.wait_for(|i| matches!(i, Indication::Disconnect(_)))
        .await?;
    println!("Disconnected");
    a.close().await?;
    echo.await??;
    Ok(())
}
