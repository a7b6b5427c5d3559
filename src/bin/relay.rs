use clap::Parser;
use ssc_pair::{logger, RelayConfig};
use std::net::SocketAddr;

/// Signaling relay для пар sender/receiver
#[derive(Parser, Debug)]
#[command(name = "ssc-relay", version, about)]
struct Args {
    /// Адрес для WebSocket соединений
    #[arg(long, env = "SSC_RELAY_BIND", default_value = ssc_pair::config::DEFAULT_RELAY_ADDR)]
    bind: SocketAddr,

    /// Фильтр логов в формате EnvFilter
    #[arg(long, env = "RUST_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init_with(args.log.as_deref());

    ssc_pair::run(RelayConfig {
        bind_addr: args.bind,
    })
    .await?;
    Ok(())
}
