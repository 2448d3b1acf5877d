//! `aevum` — command-line interface for the Aevum NPU runtime.
//!
//! ```text
//! USAGE:
//!   aevum info                Print protocol and driver versions
//!   aevum selftest            Run the runtime against the firmware emulator
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use aevum_driver::{
    AevumDevice, CarveoutAllocator, Emulator, LogCrashReporter, NetworkSpec, PmuConfig, Status,
};

#[derive(Parser)]
#[command(name = "aevum", about = "Aevum NPU runtime CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print wire-protocol and host-driver version information.
    Info,
    /// Drive the full runtime against the in-process firmware emulator.
    Selftest {
        /// Number of inferences to dispatch.
        #[arg(long, default_value_t = 8)]
        jobs: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Info => cmd_info(),
        Cmd::Selftest { jobs } => cmd_selftest(jobs),
    }
}

fn cmd_info() -> Result<()> {
    println!(
        "Wire protocol : {}.{}.{} (magic {:#010x})",
        aevum_proto::VERSION_MAJOR,
        aevum_proto::VERSION_MINOR,
        aevum_proto::VERSION_PATCH,
        aevum_proto::MAGIC
    );
    println!(
        "Limits        : {} feature maps/direction, {} PMU event slots",
        aevum_driver::FD_MAX,
        aevum_driver::PMU_EVENT_MAX
    );
    Ok(())
}

fn cmd_selftest(jobs: usize) -> Result<()> {
    println!("Starting firmware emulator ...");
    let firmware = Emulator::with_defaults();
    let dma = Arc::new(CarveoutAllocator::new(0x6000_0000, 4 << 20)?);
    let device = Arc::new(AevumDevice::new(
        firmware.transport(),
        dma,
        Box::new(LogCrashReporter),
    )?);
    firmware.connect(&device);

    device.probe()?;
    let session = device.open();
    let caps = session.capabilities()?;
    println!(
        "Device {} up. arch={}, fw={}, {} MACs/cc",
        device.name(),
        caps.arch,
        caps.firmware,
        caps.macs_per_cc
    );

    session.ping()?;
    println!("Ping answered.");

    let network = session.network_create(NetworkSpec::Index(0))?;
    let info = network.info(&session)?;
    println!(
        "Network \"{}\": {} IFM / {} OFM",
        info.desc,
        info.ifm_sizes.len(),
        info.ofm_sizes.len()
    );

    let ifm = session.buffer_create(info.ifm_sizes[0] as usize)?;
    let ofm = session.buffer_create(info.ofm_sizes[0] as usize)?;
    let pmu = PmuConfig {
        events: [1, 2, 3, 4],
        cycle_counter: true,
    };

    let mut ok = 0;
    for n in 0..jobs {
        let job = network.inference(&session, &[ifm.clone()], &[ofm.clone()], &pmu)?;
        if !job.wait(Duration::from_secs(2)) {
            anyhow::bail!("inference {n} did not complete");
        }
        let status = job.status();
        if status.status == Status::Ok {
            ok += 1;
        } else {
            println!("inference {n}: {}", status.status);
        }
        if n == 0 {
            println!(
                "First job: status={}, cycles={}, pmu={:?}, ofm_sizes={:?}",
                status.status,
                status.cycle_counter_count,
                status.pmu_event_count,
                status.ofm_sizes
            );
        }
    }

    println!("Selftest: {ok}/{jobs} inferences OK");
    anyhow::ensure!(ok == jobs, "some inferences failed");
    Ok(())
}
