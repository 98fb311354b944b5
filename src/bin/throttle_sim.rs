//! Synthetic workload driver for the throttling engine
//!
//! Pushes a burst of bios through one throttled group and reports the
//! observed delivery rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use blkthrottle::{
    Bio, BioSubmitter, ConfFile, DeviceNumber, EngineConfig, IoDir, MonotonicClock, ThrottleEngine,
};

#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "blkthrottle synthetic workload driver")]
struct Cli {
    /// Read bandwidth limit in bytes/sec (0 = unlimited)
    #[arg(long, default_value = "1048576", env = "THROTTLE_SIM_READ_BPS")]
    read_bps: u64,

    /// Write bandwidth limit in bytes/sec (0 = unlimited)
    #[arg(long, default_value = "0", env = "THROTTLE_SIM_WRITE_BPS")]
    write_bps: u64,

    /// Number of bios to issue up front
    #[arg(long, default_value = "64")]
    bios: u64,

    /// Size of each bio in bytes
    #[arg(long, default_value = "65536")]
    bio_size: u64,

    /// How long to let the engine run, in milliseconds
    #[arg(long, default_value = "2000")]
    run_ms: u64,
}

struct Counting {
    bytes: AtomicU64,
    bios: AtomicU64,
}

#[async_trait]
impl BioSubmitter for Counting {
    async fn submit(&self, bio: Bio) {
        self.bytes.fetch_add(bio.size(), Ordering::Relaxed);
        self.bios.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let sink = Arc::new(Counting {
        bytes: AtomicU64::new(0),
        bios: AtomicU64::new(0),
    });
    let engine = ThrottleEngine::new(
        EngineConfig::default(),
        Arc::new(MonotonicClock::new()),
        sink.clone(),
    );
    engine.spawn_drivers();

    let number = DeviceNumber::new(8, 0);
    let dev = engine.register_device(number)?;
    let group = engine.register_group(None)?;
    if cli.read_bps > 0 {
        engine.write_conf(group, ConfFile::ReadBps, &format!("{} {}", number, cli.read_bps))?;
    }
    if cli.write_bps > 0 {
        engine.write_conf(
            group,
            ConfFile::WriteBps,
            &format!("{} {}", number, cli.write_bps),
        )?;
    }

    tracing::info!(
        read_bps = cli.read_bps,
        write_bps = cli.write_bps,
        bios = cli.bios,
        "starting workload"
    );

    let start = Instant::now();
    let mut held = 0u64;
    for _ in 0..cli.bios {
        let bio = Bio::new(dev, IoDir::Read, cli.bio_size);
        match engine.throttle_bio(group, bio)? {
            Some(bio) => sink.submit(bio).await,
            None => held += 1,
        }
    }
    tracing::info!(held, "burst issued");

    tokio::time::sleep(Duration::from_millis(cli.run_ms)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let bytes = sink.bytes.load(Ordering::Relaxed);
    let bios = sink.bios.load(Ordering::Relaxed);
    println!(
        "delivered {} bios / {} bytes in {:.2}s ({:.0} B/s)",
        bios,
        bytes,
        elapsed,
        bytes as f64 / elapsed
    );

    engine.shutdown();
    Ok(())
}
