use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{self, Envelope};

#[derive(Parser, Debug)]
#[command(name = "harbormaster")]
#[command(about = "Relay hub between autonomous vehicles and operator clients")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect a running hub as a transient operator client
    Debug {
        /// Hub URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Print the device directory
    Devices,

    /// Attach to a device and stream its telemetry to stdout
    Watch {
        /// Device identifier
        device: String,

        /// Stop after this many frames (0 streams forever)
        #[arg(short = 'n', long, default_value_t = 0)]
        count: usize,
    },
}

pub async fn run_debug_client(url: String, command: DebugCommands) -> Result<()> {
    let client_id = format!("debug-{}", Uuid::new_v4());
    let ws_url = format!("{}/client/{}", url.trim_end_matches('/'), client_id);
    debug!(url = %ws_url, "connecting to hub");

    let (stream, _) = timeout(Duration::from_secs(5), connect_async(&ws_url))
        .await
        .map_err(|_| anyhow!("connection timeout - is the hub running at {url}?"))?
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    let (mut write, mut read) = stream.split();

    match command {
        DebugCommands::Devices => {
            let request = protocol::encode(&Envelope::DevicesList { devices: None });
            write.send(Message::Text(request.into())).await?;

            let deadline = timeout(Duration::from_secs(5), async {
                while let Some(msg) = read.next().await {
                    if let Message::Text(text) = msg? {
                        if let Ok(Envelope::DevicesList {
                            devices: Some(devices),
                        }) = protocol::decode(text.as_str())
                        {
                            return Ok(devices);
                        }
                    }
                }
                Err(anyhow!("hub closed the connection before replying"))
            });
            let devices = deadline
                .await
                .map_err(|_| anyhow!("timed out waiting for the device directory"))??;

            if devices.is_empty() {
                println!("no devices known to the hub");
            }
            for device in devices {
                println!(
                    "{}\t{}\t{}\t{}",
                    device.id,
                    device.name.as_deref().unwrap_or("-"),
                    device.kind.as_deref().unwrap_or("-"),
                    if device.connected { "connected" } else { "disconnected" },
                );
            }
        }

        DebugCommands::Watch { device, count } => {
            let request = protocol::encode(&Envelope::ConnectDevice {
                device_id: device.clone(),
            });
            write.send(Message::Text(request.into())).await?;

            let mut seen = 0usize;
            while let Some(msg) = read.next().await {
                let Message::Text(text) = msg? else { continue };
                match protocol::decode(text.as_str()) {
                    Ok(Envelope::Telemetry { device_id, .. })
                        if device_id.as_deref() == Some(device.as_str()) =>
                    {
                        println!("{text}");
                        seen += 1;
                        if count > 0 && seen >= count {
                            break;
                        }
                    }
                    Ok(Envelope::DeviceConnected { status, .. }) => {
                        eprintln!("device {device} is {status:?}");
                    }
                    Ok(Envelope::Ping) => {
                        let pong = protocol::encode(&Envelope::Pong);
                        write.send(Message::Text(pong.into())).await?;
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
