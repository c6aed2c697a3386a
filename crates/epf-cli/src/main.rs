// SPDX-License-Identifier: AGPL-3.0-only

//! `epf`: command-line front end for the PCIe EPF link transport.
//!
//! ```text
//! USAGE:
//!   epf layout [--transport T]        Print the MCB field map
//!   epf loopback [options]            Move data through all four primitives
//!   epf selftest [--size N]           Run the PCI test suite over loopback
//! ```
//!
//! `EPF_TRANSPORT`, `EPF_DOORBELL_METHOD`, `EPF_NR_SUBDEVICES` and
//! `EPF_WAIT_TIMEOUT_MS` set the defaults; flags override them.

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use epf_driver::{
    DoorbellMethod, Loopback, TestHost, Transfer, TransportConfig, TransportKind, WaitOpts,
};
use epf_proto::bar::NUM_BARS;
use epf_proto::limits::DMA_ALIGN;
use epf_proto::Field;
use rand::RngCore;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "epf", about = "PCIe EPF link transport tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the MCB field map of one or every transport.
    Layout {
        /// excalibur, moemoekyun or bsb (all when omitted).
        #[arg(long)]
        transport: Option<TransportKind>,
    },
    /// Run EP-OB, EP-IB, RC-OB and RC-IB over an in-process link.
    Loopback {
        /// excalibur, moemoekyun or bsb.
        #[arg(long)]
        transport: Option<TransportKind>,
        /// msi or gpio.
        #[arg(long)]
        doorbell: Option<DoorbellMethod>,
        /// Bytes per transfer.
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
        /// Subdevice slot to use.
        #[arg(long, default_value_t = 0)]
        subdev: usize,
        /// Rounds of each primitive.
        #[arg(long, default_value_t = 8)]
        iterations: u32,
    },
    /// Run the PCI endpoint test suite over an in-process link.
    Selftest {
        /// Bytes per WRITE/READ/COPY.
        #[arg(long, default_value_t = 64 << 10)]
        size: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Layout { transport } => cmd_layout(transport),
        Cmd::Loopback {
            transport,
            doorbell,
            size,
            subdev,
            iterations,
        } => cmd_loopback(transport, doorbell, size, subdev, iterations)?,
        Cmd::Selftest { size } => cmd_selftest(size)?,
    }

    Ok(())
}

fn cmd_layout(transport: Option<TransportKind>) {
    let kinds = transport.map_or_else(|| TransportKind::ALL.to_vec(), |k| vec![k]);
    for kind in kinds {
        let layout = kind.layout();
        println!(
            "{kind}: {:#x} bytes, up to {} subdevice(s), trailer {}",
            layout.size(),
            layout.max_subdevices(),
            if layout.has_trailer() { "yes" } else { "no" }
        );
        println!("  {:<22} {:<7} {:>8} {:>8}", "field", "writer", "offset", "stride");
        for field in Field::ALL {
            let Some(base) = layout.offset(field, 0) else {
                continue;
            };
            let stride = layout
                .offset(field, 1)
                .map_or_else(|| "-".to_string(), |next| format!("{:#x}", next - base));
            println!(
                "  {:<22} {:<7} {:>#8x} {:>8}",
                field.name(),
                field.writer().to_string(),
                base,
                stride
            );
        }
        println!();
    }
}

fn random(len: usize) -> Vec<u8> {
    let mut v = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut v);
    v
}

fn loopback_config(
    transport: Option<TransportKind>,
    doorbell: Option<DoorbellMethod>,
    size: usize,
    subdev: usize,
) -> Result<TransportConfig> {
    ensure!(size > 0, "--size must be non-zero");
    let mut config = TransportConfig::from_env()?;
    if let Some(t) = transport {
        config.transport = t;
    }
    if let Some(d) = doorbell {
        config.doorbell = d;
    }
    config.nr_subdevices = config.nr_subdevices.max(subdev + 1);
    config.region_size = size.next_multiple_of(DMA_ALIGN as usize);
    config.rc_pool_size = (config.nr_subdevices * config.region_size + 2 * size + (1 << 20))
        .next_power_of_two();
    config.ep_mem_size = (2 * size + (1 << 20)).next_power_of_two();
    config.validate()?;
    Ok(config)
}

struct Stat {
    name: &'static str,
    bytes: u64,
    elapsed: Duration,
}

impl Stat {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            bytes: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn add(&mut self, bytes: usize, since: Instant) {
        self.bytes += bytes as u64;
        self.elapsed += since.elapsed();
    }

    #[allow(clippy::cast_precision_loss)]
    fn print(&self) {
        let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "  {:<6} {:>10} bytes in {:>10.3?}  {:>9.1} MB/s",
            self.name,
            self.bytes,
            self.elapsed,
            self.bytes as f64 / secs / 1e6
        );
    }
}

fn cmd_loopback(
    transport: Option<TransportKind>,
    doorbell: Option<DoorbellMethod>,
    size: usize,
    idx: usize,
    iterations: u32,
) -> Result<()> {
    let config = loopback_config(transport, doorbell, size, idx)?;
    let link = Loopback::new(&config).context("Failed to build loopback link")?;
    let (rc, ep) = (link.rc(), link.ep());
    tracing::info!("Loopback up: {rc:?} <-> {ep:?}");
    let wait = WaitOpts::default();
    let len = u32::try_from(size).context("--size exceeds 32 bits")?;

    println!(
        "{} / {} doorbell, subdevice {idx} of {}, {size} bytes x {iterations}",
        config.transport, config.doorbell, config.nr_subdevices
    );

    let rmem = rc.region(idx)?.bus_addr();
    let ep_src = ep.alloc(size)?;
    let ep_dst = ep.alloc(size)?;
    let mut stats = [
        Stat::new("EP-OB"),
        Stat::new("EP-IB"),
        Stat::new("RC-OB"),
        Stat::new("RC-IB"),
    ];

    // EP plane: each primitive answers one RC exchange
    for _ in 0..iterations {
        let data = random(size);
        ep_src.write(0, &data)?;

        let t = Instant::now();
        thread::scope(|s| -> Result<()> {
            let req = s.spawn(|| rc.exchange(idx, len, wait));
            ep.ep_outbound(&Transfer::new(idx, ep_src.bus_addr(), rmem, size), wait)?;
            let reply = req.join().map_err(|_| anyhow!("RC thread panicked"))??;
            ensure!(reply == len, "EP-OB reply {reply}, expected {len}");
            Ok(())
        })?;
        stats[0].add(size, t);
        ensure!(rc.region(idx)?.to_vec()?[..size] == data[..], "EP-OB data mismatch");

        let t = Instant::now();
        thread::scope(|s| -> Result<()> {
            let req = s.spawn(|| rc.exchange(idx, len, wait));
            ep.ep_inbound(&Transfer::new(idx, ep_dst.bus_addr(), rmem, size), wait)?;
            req.join().map_err(|_| anyhow!("RC thread panicked"))??;
            Ok(())
        })?;
        stats[1].add(size, t);
        ensure!(ep_dst.to_vec()? == data, "EP-IB data mismatch");
    }

    // RC plane: the EP publishes a window and consumes each completion
    let rc_src = rc.alloc(size)?;
    let rc_dst = rc.alloc(size)?;
    for _ in 0..iterations {
        let data = random(size);
        rc_src.write(0, &data)?;

        ep.publish_window(idx, ep_dst.bus_addr(), size, 0)?;
        let t = Instant::now();
        rc.rc_outbound(&Transfer::new(idx, rc_src.bus_addr(), 0, size), wait)?;
        stats[2].add(size, t);
        ensure!(ep.wait_msg2ep(idx, wait)? == len, "RC-OB size mismatch");
        ensure!(ep_dst.to_vec()? == data, "RC-OB data mismatch");

        ep.publish_window(idx, ep_dst.bus_addr(), size, 0)?;
        let t = Instant::now();
        rc.rc_inbound(&Transfer::new(idx, rc_dst.bus_addr(), 0, size), wait)?;
        stats[3].add(size, t);
        ep.wait_msg2ep(idx, wait)?;
        ensure!(rc_dst.to_vec()? == data, "RC-IB data mismatch");
    }

    for s in &stats {
        s.print();
    }
    println!(
        "  DMA descriptors: RC {}  EP {}",
        link.rc_dma().submitted(),
        link.ep_dma().submitted()
    );
    Ok(())
}

fn cmd_selftest(size: usize) -> Result<()> {
    let mut config = TransportConfig::from_env()?;
    config.rc_pool_size = (3 * size + (1 << 20)).next_power_of_two().max(config.rc_pool_size);
    config.ep_mem_size = (size + (1 << 20)).next_power_of_two().max(config.ep_mem_size);
    let link = Loopback::new(&config).context("Failed to build loopback link")?;
    let _function = link.start_test_function()?;
    tracing::info!("PCI test suite, {size} bytes per transfer");
    let host = TestHost::new();
    let rc = link.rc();

    let mut checks: Vec<(String, epf_driver::Result<()>)> = Vec::new();
    for n in 0..NUM_BARS {
        if rc.bars()[n].is_some() {
            checks.push((format!("BAR{n}"), host.bar(rc, n)));
        }
    }
    checks.push(("LEGACY IRQ".into(), host.legacy_irq(rc)));
    for v in [1, 32] {
        checks.push((format!("MSI{v}"), host.msi(rc, v)));
    }
    for v in [1, 2048] {
        checks.push((format!("MSI-X{v}"), host.msix(rc, v)));
    }
    for dma in [true, false] {
        host.set_use_dma(dma);
        let mode = if dma { "DMA" } else { "CPU" };
        checks.push((format!("WRITE {size} ({mode})"), host.write(rc, size)));
        checks.push((format!("READ {size} ({mode})"), host.read(rc, size)));
        checks.push((format!("COPY {size} ({mode})"), host.copy(rc, size)));
    }

    let mut failed = 0;
    for (name, result) in &checks {
        match result {
            Ok(()) => println!("{name:<28} OKAY"),
            Err(e) => {
                failed += 1;
                println!("{name:<28} NOT OKAY ({e})");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} checks failed", checks.len());
    }
    Ok(())
}
