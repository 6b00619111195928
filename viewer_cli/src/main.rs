use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};

use clap::Parser;
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use timeline_core::{load_viewer_config_from_env, ViewerConfig};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, trace, warn};

mod app;
mod ui;

use app::{channel, outbound_channel, TransportEvent, ViewerApp};

#[derive(Clone)]
struct ChannelWriter {
    sender: Sender<String>,
}

impl std::io::Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(text) = String::from_utf8(buf.to_vec()) {
            let _ = self.sender.send(text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal viewer for agent-based simulation servers", long_about = None)]
struct Cli {
    /// Websocket endpoint of the visualization server.
    #[arg(long)]
    endpoint: Option<String>,
    /// JSON viewer config; overrides VIEWER_CONFIG_PATH.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Delay between steps during local playback.
    #[arg(long)]
    playback_interval_ms: Option<u64>,
    /// How long to wait for a requested step before retrying.
    #[arg(long)]
    step_timeout_ms: Option<u64>,
}

impl Cli {
    fn viewer_config(&self) -> Result<ViewerConfig> {
        let mut config = match &self.config {
            Some(path) => ViewerConfig::from_file(path)?,
            None => load_viewer_config_from_env().0,
        };
        if let Some(endpoint) = &self.endpoint {
            config = config.with_endpoint(endpoint.clone());
        }
        if let Some(interval) = self.playback_interval_ms {
            config = config.with_playback_interval_ms(interval);
        }
        if let Some(timeout) = self.step_timeout_ms {
            config = config.with_step_timeout_ms(timeout);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let (log_tx, log_rx) = mpsc::channel::<String>();
    let log_writer_tx = log_tx.clone();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .with_writer(move || ChannelWriter {
            sender: log_writer_tx.clone(),
        })
        .init();

    let cli = Cli::parse();
    let config = cli.viewer_config()?;
    let endpoint = config.endpoint().to_string();
    let reconnect_delay = config.reconnect_delay();
    info!("Connecting to simulation at {}", endpoint);

    let (event_tx, event_rx) = channel();
    let (sink, mut outbound_rx) = outbound_channel();
    let (shutdown_tx, mut shutdown_rx) = unbounded_channel::<()>();

    let _ui_handle = std::thread::spawn(move || -> color_eyre::Result<()> {
        let app = ViewerApp::new(config, sink, event_rx, shutdown_tx, log_rx)?;
        app.run()
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Viewer requested shutdown");
                break;
            }
            result = run_connection(&endpoint, &event_tx, &mut outbound_rx) => {
                let _ = event_tx.send(TransportEvent::Disconnected);
                match result {
                    Ok(()) => info!("Server closed the connection"),
                    Err(err) => warn!("Connection error: {}", err),
                }
            }
        }
        info!(
            "Reconnecting in {:.1} seconds...",
            reconnect_delay.as_secs_f32()
        );
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Viewer requested shutdown");
                break;
            }
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }

    Ok(())
}

async fn run_connection(
    endpoint: &str,
    events: &UnboundedSender<TransportEvent>,
    outbound: &mut UnboundedReceiver<String>,
) -> Result<()> {
    let (stream, _response) = connect_async(endpoint).await?;
    let (mut write, mut read) = stream.split();

    // Commands queued while offline belong to the previous connection.
    while outbound.try_recv().is_ok() {}
    info!("Connected. Press q to exit.");
    if events.send(TransportEvent::Connected).is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    trace!(%frame, "frame.sent");
                    write.send(Message::Text(frame)).await?;
                }
                None => break,
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Frame(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
        }
    }
    Ok(())
}
