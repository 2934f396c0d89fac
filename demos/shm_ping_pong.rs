use std::time::Duration;

use anyhow::bail;
use clap::{Parser, ValueEnum};
use cluon::{SharedMemorySegment, TimeStamp};
use tracing::{info, Level};

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Producer,
    Consumer,
}

/// Exchanges a counter through a shared memory segment. Start the producer first, then any number
///  of consumers with the same name.
#[derive(Parser)]
struct Args {
    #[clap(value_enum)]
    role: Role,

    #[clap(long, default_value = "/cluon-ping-pong")]
    name: String,

    #[clap(long, default_value_t = 100)]
    interval_millis: u64,

    #[clap(long, default_value_t = 50)]
    count: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::TRACE } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.role {
        Role::Producer => produce(&args),
        Role::Consumer => consume(&args),
    }
}

fn produce(args: &Args) -> anyhow::Result<()> {
    let mut segment = SharedMemorySegment::create(&args.name, std::mem::size_of::<u64>())?;
    info!("created segment {} with {} bytes", segment.name(), segment.size());

    for counter in 1..=args.count {
        segment.lock()?;
        segment.set_data(&counter.to_le_bytes())?;
        segment.set_timestamp(TimeStamp::now())?;
        segment.unlock()?;
        segment.notify_all()?;

        info!("published {}", counter);
        std::thread::sleep(Duration::from_millis(args.interval_millis));
    }
    Ok(())
}

fn consume(args: &Args) -> anyhow::Result<()> {
    let mut segment = SharedMemorySegment::open(&args.name)?;
    if segment.size() < std::mem::size_of::<u64>() {
        bail!("segment {} is too small: {} bytes", segment.name(), segment.size());
    }

    let patience = Duration::from_millis(args.interval_millis * 10);
    loop {
        if !segment.wait_timeout(patience)? {
            info!("no notification for {:?}, assuming the producer is done", patience);
            return Ok(());
        }

        segment.lock()?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&segment.data()?[..8]);
        let ts = segment.timestamp()?;
        segment.unlock()?;

        let counter = u64::from_le_bytes(raw);
        info!("received {} (written at {:.6})", counter, ts.as_secs_f64());
        if counter >= args.count {
            return Ok(());
        }
    }
}
