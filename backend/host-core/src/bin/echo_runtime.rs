//! Reference extension runtime.
//!
//! Adopts every transport the host hands over and echoes each regular
//! message back on the persistent channel. Exits when the client sends a
//! disconnect or the host closes the IPC hook.

use host_core::channel::{Delivery, PersistentChannel};
use host_core::config::ChannelConfig;
use host_core::error::RuntimeError;
use host_core::runtime::launch::LOG_LEVEL_ENV;
use host_core::runtime::{AdoptedTransport, RuntimeClient, RuntimeEvent};
use host_core::session::GraceTimer;

use std::env;
use std::process::ExitCode;
use std::str::FromStr;

use log::{LevelFilter, debug, error, info, warn};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logger();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Echo runtime failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logger() {
    let level = env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|value| LevelFilter::from_str(&value).ok())
        .unwrap_or(LevelFilter::Info);

    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} - {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();
    if let Err(e) = result {
        eprintln!("Logger already initialised: {e}");
    }
}

async fn run() -> Result<(), RuntimeError> {
    let mut client = RuntimeClient::connect_from_env().await?;
    client.send_ready().await?;
    client
        .send_console(json!(["echo runtime ready", std::process::id()]))
        .await?;

    let config = ChannelConfig::default();
    let mut channel: Option<PersistentChannel> = None;

    loop {
        let ack_deadline = channel.as_ref().and_then(PersistentChannel::ack_deadline);

        tokio::select! {
            event = client.next_event() => match event? {
                Some(RuntimeEvent::Transport(adopted)) => {
                    if adopt(&mut channel, adopted, &config).await {
                        return Ok(());
                    }
                }
                Some(RuntimeEvent::ReduceGraceTime) => {
                    info!("Another client connected to the host");
                }
                None => {
                    info!("Host closed the IPC hook");
                    return Ok(());
                }
            },
            chunk = read_chunk(channel.as_mut()) => {
                let Some(active) = channel.as_mut() else {
                    continue;
                };
                let deliveries = match chunk {
                    Ok(chunk) => active.accept_chunk(chunk).await,
                    Err(e) => Err(e),
                };
                match deliveries {
                    Ok(deliveries) => {
                        if echo(active, deliveries).await {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!("Transport failed, waiting for a new one: {e}");
                        active.lose_carrier();
                    }
                }
            }
            _ = GraceTimer::expired(ack_deadline) => {
                if let Some(active) = channel.as_mut() {
                    if let Err(e) = active.send_ack_if_needed().await {
                        debug!("Ack not delivered: {e}");
                    }
                }
            }
        }
    }
}

/// Returns `true` when the client asked to disconnect.
async fn adopt(
    channel: &mut Option<PersistentChannel>,
    adopted: AdoptedTransport,
    config: &ChannelConfig,
) -> bool {
    let AdoptedTransport {
        transport,
        initial_data_chunk,
    } = adopted;

    let deliveries = match channel.as_mut() {
        Some(active) => {
            info!("Swapping to a new transport");
            active.begin_accept_reconnection(transport, initial_data_chunk);
            active.end_accept_reconnection().await
        }
        None => {
            info!("Adopted the first transport");
            channel
                .insert(PersistentChannel::resume(transport, initial_data_chunk, config))
                .deliver_buffered()
                .await
        }
    };

    let Some(active) = channel.as_mut() else {
        return false;
    };
    match deliveries {
        Ok(deliveries) => echo(active, deliveries).await,
        Err(e) => {
            warn!("Adopted transport failed: {e}");
            active.lose_carrier();
            false
        }
    }
}

/// Returns `true` when the client asked to disconnect.
async fn echo(channel: &mut PersistentChannel, deliveries: Vec<Delivery>) -> bool {
    for delivery in deliveries {
        match delivery {
            Delivery::Message(data) => {
                debug!("Echoing {} bytes", data.len());
                if let Err(e) = channel.send(data).await {
                    debug!("Echo queued, transport failed: {e}");
                }
            }
            Delivery::Control(data) => debug!("Ignoring {} byte control message", data.len()),
            Delivery::PeerDisconnected => {
                info!("Client disconnected");
                channel.close().await;
                return true;
            }
            Delivery::SocketClosed => info!("Transport closed, waiting for a new one"),
        }
    }
    false
}

async fn read_chunk(
    channel: Option<&mut PersistentChannel>,
) -> Result<Vec<u8>, host_core::error::ChannelError> {
    match channel {
        Some(channel) => channel.read_chunk().await,
        None => std::future::pending().await,
    }
}
