//! DMA validation.
//!
//! Four stages over the memory-mapped DMA queue, each harder on the memory
//! subsystem than the last: a sequential write/read/compare pass per
//! region, a simultaneous read+write thread pair per region, simultaneous
//! writes to two channels of the same memory, and an eight-writer aggregate
//! PCIe bandwidth measurement.

use std::time::Instant;

use anyhow::{Context, Result, bail};

use slash_rt::error::Result as RtResult;
use slash_rt::qdma::QdmaIntf;
use slash_rt::{Bdf, DDR_SIZE, DDR_START, HBM_PORT_SIZE, HBM_START};

use super::normalize_bdf;
use crate::cli::ValidateArgs;

/// Writers spawned by the PCIe bandwidth stage.
const PCIE_BW_THREADS: usize = 8;
/// Address stride between PCIe bandwidth writers (2 GiB).
const PCIE_BW_STRIDE: u64 = 0x8000_0000;

/// Runs the full validation ladder against a device.
pub fn run(args: &ValidateArgs) -> Result<()> {
    let bdf = Bdf::parse(&normalize_bdf(&args.device)).context("parsing device address")?;
    let intf = QdmaIntf::mm(&bdf);
    if !intf.path().exists() {
        bail!(
            "device {} does not exist; run as root: /usr/local/vrt/setup_queues.sh {} --mm 0 bi",
            intf.path().display(),
            bdf,
        );
    }

    println!("Running validation for device: {bdf}");
    for (name, base) in [("HBM", HBM_START), ("DDR", DDR_START)] {
        println!("Performing seq RW test for {name}");
        test_region(&intf, base, args.size, args.count)
            .with_context(|| format!("{name} test failed"))?;
    }

    for (name, base) in [("HBM", HBM_START), ("DDR", DDR_START)] {
        println!("Performing simultaneous RW test for {name}");
        simultaneous_rw(&intf, base, args.size, args.count)
            .with_context(|| format!("simultaneous {name} test failed"))?;
    }

    // Two HBM channels sit one port apart; the second DDR target is the
    // upper half of the DIMM.
    println!("Running simultaneous write test on multiple HBM channels");
    dual_channel(&intf, HBM_START, HBM_START + 2 * HBM_PORT_SIZE, args.size, args.count)
        .context("dual-channel HBM test failed")?;
    println!("Running simultaneous write test on multiple DDR channels");
    dual_channel(&intf, DDR_START, DDR_START + DDR_SIZE / 2, args.size, args.count)
        .context("dual-channel DDR test failed")?;

    pcie_bandwidth(&intf, args.size, args.count).context("PCIe bandwidth test failed")?;

    println!("All tests passed");
    Ok(())
}

fn make_pattern(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Sequential write, read back, compare; reports per-iteration bandwidth.
fn test_region(intf: &QdmaIntf, base: u64, size: u64, count: u32) -> Result<()> {
    let pattern = make_pattern(size);
    let mut readback = vec![0u8; size as usize];

    for iteration in 0..count {
        let started = Instant::now();
        intf.write_buff(&pattern, base)?;
        intf.read_buff(&mut readback, base)?;
        if readback != pattern {
            bail!("data mismatch on iteration {iteration}");
        }
        let elapsed = started.elapsed().as_secs_f64();
        let gbps = (2.0 * size as f64) / elapsed / 1e9;
        println!("  iteration {iteration}: {gbps:.2} GB/s");
    }
    Ok(())
}

/// One writer and one reader hammering the same region concurrently. A
/// stress pass, not a data check: the reader races the writer by design.
fn simultaneous_rw(intf: &QdmaIntf, base: u64, size: u64, count: u32) -> Result<()> {
    let pattern = make_pattern(size);
    std::thread::scope(|scope| {
        let writer = scope.spawn(|| -> RtResult<()> {
            for _ in 0..count {
                intf.write_buff(&pattern, base)?;
            }
            Ok(())
        });
        let reader = scope.spawn(|| -> RtResult<()> {
            let mut buf = vec![0u8; size as usize];
            for _ in 0..count {
                intf.read_buff(&mut buf, base)?;
            }
            Ok(())
        });
        writer.join().unwrap()?;
        reader.join().unwrap()?;
        Ok(())
    })
}

/// Simultaneous writes to two channels of one memory, then simultaneous
/// reads back from both.
fn dual_channel(intf: &QdmaIntf, chan0: u64, chan1: u64, size: u64, count: u32) -> Result<()> {
    let pattern = make_pattern(size);
    let pattern = &pattern;

    std::thread::scope(|scope| {
        let writers: Vec<_> = [chan0, chan1]
            .into_iter()
            .map(|base| {
                scope.spawn(move || -> RtResult<()> {
                    for _ in 0..count {
                        intf.write_buff(pattern, base)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap()?;
        }
        Ok::<(), anyhow::Error>(())
    })?;

    std::thread::scope(|scope| {
        let readers: Vec<_> = [chan0, chan1]
            .into_iter()
            .map(|base| {
                scope.spawn(move || -> RtResult<()> {
                    let mut buf = vec![0u8; size as usize];
                    for _ in 0..count {
                        intf.read_buff(&mut buf, base)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for reader in readers {
            reader.join().unwrap()?;
        }
        Ok(())
    })
}

/// Eight writers at 2 GiB strides across DDR; the per-thread bandwidths
/// sum to the aggregate PCIe figure.
fn pcie_bandwidth(intf: &QdmaIntf, size: u64, count: u32) -> Result<()> {
    let pattern = make_pattern(size);
    let pattern = &pattern;

    let total: f64 = std::thread::scope(|scope| {
        let writers: Vec<_> = (0..PCIE_BW_THREADS)
            .map(|i| {
                let base = DDR_START + i as u64 * PCIE_BW_STRIDE;
                scope.spawn(move || -> RtResult<f64> {
                    let started = Instant::now();
                    for _ in 0..count {
                        intf.write_buff(pattern, base)?;
                    }
                    let elapsed = started.elapsed().as_secs_f64();
                    Ok((size * u64::from(count)) as f64 / elapsed / 1e9)
                })
            })
            .collect();

        let mut total = 0.0;
        for writer in writers {
            total += writer.join().unwrap()?;
        }
        Ok::<f64, anyhow::Error>(total)
    })?;

    println!("+---------------------------------------------------+");
    println!("| Total PCIe Bandwidth (GB/s): {total:<20.2} |");
    println!("+---------------------------------------------------+");
    Ok(())
}
