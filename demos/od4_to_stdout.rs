use std::net::Ipv4Addr;

use clap::Parser;
use cluon::{OD4Session, SessionConfig};
use tracing::{info, Level};

/// Joins an OD4 session and prints every envelope that is broadcast to it.
#[derive(Parser)]
struct Args {
    /// the session's group id, i.e. the last octet of the multicast address 225.0.0.x
    #[clap(long)]
    cid: u8,

    /// the local interface used for multicast
    #[clap(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    #[clap(long, default_value_t = cluon::session::session_config::DEFAULT_PORT)]
    port: u16,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = SessionConfig::new(args.cid);
    config.multicast_interface = args.interface;
    config.port = args.port;
    // show what other components on this host send as well
    config.drop_own_datagrams = false;

    let session = OD4Session::with_config(config).await?;
    info!("listening on {}:{}", session.config().multicast_addr(), session.config().port);

    session.add_catch_all_trigger(|envelope| {
        println!(
            "type={} stamp={} sent={:.6} received={:.6} sampled={:.6} payload={} bytes",
            envelope.data_type,
            envelope.sender_stamp,
            envelope.sent.as_secs_f64(),
            envelope.received.as_secs_f64(),
            envelope.sampled.as_secs_f64(),
            envelope.serialized_data.len(),
        );
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
