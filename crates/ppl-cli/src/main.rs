#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ppl_block::FileMemberDevice;
use ppl_log::{EntryCheck, LogRegion, check_entries, scan_region};
use ppl_types::SECTOR_SIZE;
use serde::Serialize;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InspectOptions {
    /// Log region start, in sectors from the start of the image.
    offset: u64,
    /// Log region length, in sectors.
    size: u64,
    sector_size: u32,
    json: bool,
}

#[derive(Debug, Serialize)]
struct RecordReport {
    offset: u64,
    signature: String,
    generation: u64,
    entries: Vec<EntryCheck>,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    region_offset: u64,
    region_size: u64,
    multi_slot: bool,
    records: Vec<RecordReport>,
    stop_reason: Option<String>,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let opts = parse_inspect_args(args)?;
            let output = inspect(Path::new(&path), opts)?;
            print_output(&output, opts.json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ppl-cli\n");
    println!("USAGE:");
    println!(
        "  ppl-cli inspect <image-path> --offset <sectors> --size <sectors> [--sector-size <bytes>] [--json]"
    );
}

fn parse_inspect_args(mut args: impl Iterator<Item = String>) -> Result<InspectOptions> {
    let mut offset = None;
    let mut size = None;
    let mut sector_size = SECTOR_SIZE;
    let mut json = false;

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--offset" => {
                offset = Some(value("--offset")?.parse::<u64>().context("parse --offset")?);
            }
            "--size" => size = Some(value("--size")?.parse::<u64>().context("parse --size")?),
            "--sector-size" => {
                sector_size = value("--sector-size")?
                    .parse::<u32>()
                    .context("parse --sector-size")?;
            }
            "--json" => json = true,
            other => bail!("unexpected argument: {other}"),
        }
    }

    if !sector_size.is_power_of_two() || sector_size < SECTOR_SIZE {
        bail!("--sector-size must be a power of two of at least {SECTOR_SIZE}");
    }
    Ok(InspectOptions {
        offset: offset.context("inspect requires --offset")?,
        size: size.context("inspect requires --size")?,
        sector_size,
        json,
    })
}

fn inspect(path: &Path, opts: InspectOptions) -> Result<InspectOutput> {
    let dev = FileMemberDevice::open(path)
        .with_context(|| format!("failed to open member image {}", path.display()))?;
    let sector = u64::from(opts.sector_size);
    let offset = opts
        .offset
        .checked_mul(sector)
        .context("--offset overflows")?;
    let raw = opts.size.checked_mul(sector).context("--size overflows")?;
    let region = LogRegion::from_bytes(offset, raw)
        .with_context(|| format!("log region of {raw} bytes is too small"))?;

    let scan = scan_region(&dev, &region, None)
        .with_context(|| format!("failed to scan log region in {}", path.display()))?;
    let records = scan
        .headers
        .iter()
        .map(|location| {
            let entries = check_entries(&dev, &region, location)
                .with_context(|| format!("failed to read partial parity at {}", location.offset))?;
            Ok(RecordReport {
                offset: location.offset,
                signature: format!("{:#010x}", location.header.signature),
                generation: location.header.generation,
                entries,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(InspectOutput {
        region_offset: region.offset,
        region_size: region.size,
        multi_slot: region.multi_slot,
        records,
        stop_reason: scan.stop_reason,
    })
}

fn print_output(output: &InspectOutput, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(output).context("serialize output")?
        );
        return Ok(());
    }

    println!("Partial Parity Log Inspector");
    println!("region_offset: {}", output.region_offset);
    println!("region_size: {}", output.region_size);
    println!("multi_slot: {}", output.multi_slot);
    for record in &output.records {
        println!(
            "record @{}: signature={} generation={} entries={}",
            record.offset,
            record.signature,
            record.generation,
            record.entries.len()
        );
        for check in &record.entries {
            let entry = &check.entry;
            println!(
                "  [{}] data_sector={} parity_disk={} data_size={} pp_size={} checksum={:#010x} {}",
                check.index,
                entry.data_sector,
                entry.parity_disk,
                entry.data_size,
                entry.pp_size,
                entry.checksum,
                if check.valid { "ok" } else { "MISMATCH" }
            );
        }
    }
    if let Some(reason) = &output.stop_reason {
        println!("scan stopped: {reason}");
    }
    Ok(())
}
