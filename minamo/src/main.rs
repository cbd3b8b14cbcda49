use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use minamo::config::Config;
use minamo::relay::{DirectClient, Headroom, PlainSessionServer, Socks5TcpService};
use minamo::relay::{UdpRelaySettings, UdpSessionRelay};
use minamo::router::Router;
use minamo::stats::AtomicCollector;

const PROG_NAME: &str = env!("CARGO_BIN_NAME");
const PROG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minamo session-oriented proxy server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// config path
    #[arg(short, long, value_name = "FILE_PATH")]
    config: String,
}

fn create_udp_relay(config: &Config, collector: Arc<AtomicCollector>) -> UdpSessionRelay {
    let router = Router::new(Arc::new(DirectClient::new(
        "direct".to_string(),
        config.mtu,
        0,
    )));
    let settings = UdpRelaySettings {
        server_name: config.server_name.clone(),
        listen_address: config.listen_address,
        listener_fwmark: config.listener_fwmark,
        mtu: config.mtu,
        relay_batch_size: config.relay_batch_size,
        server_recv_batch_size: config.server_recv_batch_size,
        send_channel_capacity: config.send_channel_capacity,
        nat_timeout: config.nat_timeout,
        batch_mode: config.batch_mode.clone(),
        max_client_packer_headroom: Headroom::default(),
    };
    UdpSessionRelay::new(
        settings,
        Arc::new(PlainSessionServer::new()),
        collector,
        Arc::new(router),
    )
}

async fn serve(config: Arc<Config>) -> Result<()> {
    let collector = Arc::new(AtomicCollector::new());

    let udp_relay = create_udp_relay(&config, collector.clone());
    udp_relay.start().await?;

    let tcp_task = match config.tcp_listen_address {
        Some(listen_address) => {
            let credentials = config.credentials()?.map(Arc::new);
            let service =
                Socks5TcpService::bind(config.server_name.clone(), listen_address, credentials)
                    .await?;
            Some(tokio::spawn(service.serve()))
        }
        None => None,
    };

    signal::ctrl_c().await?;
    info!("{PROG_NAME} is shutting down.");

    udp_relay.stop().await?;
    if let Some(task) = tcp_task {
        task.abort();
    }

    let snapshot = collector.snapshot();
    info!(
        uplink_packets = snapshot.uplink_packets,
        uplink_bytes = snapshot.uplink_bytes,
        downlink_packets = snapshot.downlink_packets,
        downlink_bytes = snapshot.downlink_bytes,
        "final traffic totals"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    info!("{PROG_NAME} version: {PROG_VERSION}");

    serve(Arc::new(config)).await?;

    info!("Exiting...");
    Ok(())
}
