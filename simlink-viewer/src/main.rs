// simlink viewer: headless host that keeps a simulator circuit alive and fetches assets.

mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use simlink_core::{
    AssetTransfer, DeliveryFailed, InboundMessage, MessageDictionary, MessageId,
    NetMessageListener, NetMessageManager, OutboundMessage, ReqwestAssetClient, TransferPhase,
};
use tracing::{debug, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs circuit traffic; raises `lost` when the manager gives up on the circuit.
struct LogListener {
    lost: Arc<AtomicBool>,
}

impl NetMessageListener for LogListener {
    fn on_network_message_received(&mut self, id: MessageId, msg: &InboundMessage) {
        debug!(%id, name = msg.name(), seq = msg.sequence(), "message received");
    }

    fn on_network_message_sent(&mut self, msg: &OutboundMessage) {
        debug!(name = msg.name(), seq = ?msg.sequence(), "message sent");
    }

    fn on_delivery_failed(&mut self, failure: &DeliveryFailed) {
        warn!(
            name = %failure.name,
            seq = failure.sequence,
            attempts = failure.attempts,
            "delivery failed"
        );
    }

    fn on_connection_lost(&mut self) {
        warn!("connection lost");
        self.lost.store(true, Ordering::SeqCst);
    }
}

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("simlink-viewer {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt().init();
    let cfg = config::load();

    let dictionary = match &cfg.template_path {
        Some(path) => MessageDictionary::load(path)
            .with_context(|| format!("loading message template {}", path.display()))?,
        None => MessageDictionary::bundled().context("parsing bundled message template")?,
    };
    info!(messages = dictionary.len(), "message template loaded");

    let rt = tokio::runtime::Runtime::new()?;
    let client = Arc::new(
        ReqwestAssetClient::new(rt.handle().clone(), cfg.asset.http_timeout())
            .context("building HTTP client")?,
    );

    let mut manager = NetMessageManager::new(Arc::new(dictionary), cfg.net.clone())?;
    let lost = Arc::new(AtomicBool::new(false));
    manager.register_listener(Box::new(LogListener { lost: lost.clone() }));
    manager
        .connect_to(&cfg.server, cfg.port)
        .with_context(|| format!("connecting to {}:{}", cfg.server, cfg.port))?;
    info!(server = %cfg.server, port = cfg.port, local = ?manager.local_addr(), "circuit open");

    let mut transfers: Vec<AssetTransfer> = cfg
        .assets
        .iter()
        .cloned()
        .map(|entry| AssetTransfer::new(entry.into(), client.clone(), &cfg.asset))
        .collect();
    let asset_timeout = Duration::from_millis(cfg.asset_timeout_ms);
    let frame = Duration::from_millis(cfg.frame_interval_ms.max(1));

    rt.block_on(async {
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(frame);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = Instant::now();
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    info!("shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now - last;
                    last = now;
                    manager.process_messages();
                    if lost.load(Ordering::SeqCst) {
                        break;
                    }
                    update_transfers(&mut transfers, dt, asset_timeout);
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;

    report(&manager);
    manager.disconnect();
    for t in &mut transfers {
        t.cancel();
    }
    Ok(())
}

/// Advance every transfer one step, cancel stalled ones and drop finished ones.
fn update_transfers(transfers: &mut Vec<AssetTransfer>, dt: Duration, timeout: Duration) {
    for t in transfers.iter_mut() {
        match t.update(dt) {
            TransferPhase::Complete => {
                let name = t.parsed_metadata().map(|m| m.name).unwrap_or_default();
                info!(asset = t.asset_id(), %name, bytes = t.size(), "asset ready");
            }
            TransferPhase::Failed => {}
            TransferPhase::FetchingMetadata | TransferPhase::FetchingData => {
                if t.idle_time() >= timeout {
                    warn!(asset = t.asset_id(), idle = ?t.idle_time(), "asset transfer stalled");
                    t.cancel();
                }
            }
        }
    }
    transfers.retain(|t| !t.ready() && !t.is_failed());
}

fn report(manager: &NetMessageManager) {
    let stats = manager.stats();
    let socket = manager.connection_stats().unwrap_or_default();
    info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        resends = stats.resends,
        failures = stats.delivery_failures,
        dropped = stats.malformed_dropped + stats.unknown_dropped,
        packets_out = socket.packets_sent,
        packets_in = socket.packets_received,
        bytes_out = socket.bytes_sent,
        bytes_in = socket.bytes_received,
        rtt = ?manager.last_ping_rtt(),
        "session summary"
    );
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
