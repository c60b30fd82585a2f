#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use efs::{
    BlockSize, FilePmemDevice, MemPmemDevice, OpenFlags, PmemDevice, StatsSnapshot, Store,
    StoreConfig, StoreGeometry,
};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ── Logging ─────────────────────────────────────────────────────────────────

/// `EFS_LOG` wins over `RUST_LOG`; both fall back to `warn`.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("EFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logger: {err}"))
}

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Options {
    config: StoreConfig,
    device: Option<PathBuf>,
    blocks: u64,
    block_size: u32,
    files: u64,
    writes: u64,
    max_write: usize,
    epoch_every: u64,
    seed: u64,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: StoreConfig::default(),
            device: None,
            blocks: 4096,
            block_size: 4096,
            files: 4,
            writes: 256,
            max_write: 16 * 1024,
            epoch_every: 32,
            seed: 0x9E37_79B9_7F4A_7C15,
            json: false,
        }
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn parse_num<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value for {flag}: {value:?}"))
}

fn load_config(path: &str) -> Result<StoreConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse config {path}"))
}

/// Parse flags. A `--config` file is loaded first wherever it appears, so
/// the switch flags always override it.
fn parse_options(args: Vec<String>) -> Result<Options> {
    let mut opts = Options::default();
    if let Some(at) = args.iter().position(|a| a == "--config") {
        let Some(path) = args.get(at + 1) else {
            bail!("--config requires a value");
        };
        opts.config = load_config(path)?;
    }

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                next_value(&mut it, "--config")?;
            }
            "--device" => opts.device = Some(PathBuf::from(next_value(&mut it, &arg)?)),
            "--blocks" => opts.blocks = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--block-size" => opts.block_size = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--files" => opts.files = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--writes" => opts.writes = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--max-write" => opts.max_write = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--epoch-every" => opts.epoch_every = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--seed" => opts.seed = parse_num(&next_value(&mut it, &arg)?, &arg)?,
            "--in-place" => opts.config.in_place_writes = true,
            "--checksum" => opts.config.data_checksum = true,
            "--parity" => opts.config.data_parity = true,
            "--mmap-cow" => opts.config.mmap_cow = true,
            "--no-replica" => opts.config.metadata_replica = false,
            "--json" => opts.json = true,
            other => bail!("unknown option: {other}"),
        }
    }
    if opts.files == 0 {
        bail!("--files must be at least 1");
    }
    if opts.max_write == 0 {
        bail!("--max-write must be at least 1");
    }
    Ok(opts)
}

// ── Commands ────────────────────────────────────────────────────────────────

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
        "workload" => {
            init_logging()?;
            workload(&parse_options(args.collect())?)
        }
        "geometry" => geometry(&parse_options(args.collect())?),
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
    println!("efs\n");
    println!("USAGE:");
    println!("  efs workload [--config <file.json>] [--device <image>] [--blocks N] [--block-size N]");
    println!("               [--files N] [--writes N] [--max-write BYTES] [--epoch-every N] [--seed N]");
    println!("               [--in-place] [--checksum] [--parity] [--mmap-cow] [--no-replica] [--json]");
    println!("  efs geometry [--config <file.json>] [--blocks N] [--block-size N] [--checksum] [--parity] [--json]");
    println!();
    println!("Logging is controlled by EFS_LOG (falls back to RUST_LOG).");
}

fn block_size(opts: &Options) -> Result<BlockSize> {
    BlockSize::new(opts.block_size)
        .with_context(|| format!("invalid block size {}", opts.block_size))
}

fn geometry(opts: &Options) -> Result<()> {
    let geo = StoreGeometry::compute(block_size(opts)?, opts.blocks, &opts.config)
        .context("geometry does not fit")?;
    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&geo).context("serialize geometry")?
        );
    } else {
        print_geometry(&geo);
    }
    Ok(())
}

fn print_geometry(geo: &StoreGeometry) {
    println!("block_size: {}", geo.block_size);
    println!("total_blocks: {}", geo.total_blocks);
    println!(
        "inode_table: {} blocks at {} ({} slots)",
        geo.inode_table_blocks, geo.inode_table_start, geo.inode_slots
    );
    println!("checksum_table: {} blocks at {}", geo.csum_blocks, geo.csum_start);
    println!("parity_table: {} blocks at {}", geo.parity_blocks, geo.parity_start);
    println!("data: {} blocks at {}", geo.data_blocks, geo.data_start);
}

#[derive(Debug, Serialize)]
struct WorkloadReport {
    config: StoreConfig,
    geometry: StoreGeometry,
    files: u64,
    writes: u64,
    short_writes: u64,
    bytes_written: u64,
    bytes_verified: u64,
    final_epoch: u64,
    free_blocks: u64,
    stats: StatsSnapshot,
}

/// xorshift64*; deterministic per seed.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound.max(1)
    }
}

fn open_device(opts: &Options) -> Result<Arc<dyn PmemDevice>> {
    let bs = block_size(opts)?;
    Ok(match &opts.device {
        Some(path) => Arc::new(
            FilePmemDevice::create(path, bs, opts.blocks)
                .with_context(|| format!("failed to create device image {}", path.display()))?,
        ),
        None => Arc::new(MemPmemDevice::new(bs, opts.blocks)),
    })
}

fn workload(opts: &Options) -> Result<()> {
    let store = Store::format(open_device(opts)?, opts.config.clone())
        .context("failed to format store")?;

    let mut handles = Vec::new();
    for _ in 0..opts.files {
        let ino = store.create_file().context("failed to create file")?;
        handles.push(store.open(ino, OpenFlags::default())?);
    }
    let mut models: Vec<Vec<u8>> = vec![Vec::new(); handles.len()];
    let mut rng = Rng(opts.seed | 1);
    let span = (opts.max_write as u64).saturating_mul(4);
    let mut bytes_written = 0_u64;
    let mut short_writes = 0_u64;

    for i in 0..opts.writes {
        if opts.epoch_every > 0 && i > 0 && i % opts.epoch_every == 0 {
            store.advance_epoch();
        }
        let file = usize::try_from(rng.below(opts.files)).context("file index overflows")?;
        let len = 1 + usize::try_from(rng.below(opts.max_write as u64)).context("length overflows")?;
        let offset = rng.below(span);
        let fill = rng.next().to_le_bytes()[0];
        let data = vec![fill; len];

        let written = store
            .write(&handles[file], &data, offset)
            .with_context(|| format!("write {i} of {len} bytes at {offset} failed"))?;
        if written < len {
            short_writes += 1;
        }
        let start = usize::try_from(offset).context("offset overflows")?;
        let model = &mut models[file];
        if model.len() < start + written {
            model.resize(start + written, 0);
        }
        model[start..start + written].copy_from_slice(&data[..written]);
        bytes_written += written as u64;
    }

    let mut bytes_verified = 0_u64;
    for (fh, model) in handles.iter().zip(&models) {
        let mut buf = vec![0_u8; model.len()];
        let n = store.read(fh, &mut buf, 0)?;
        if n != model.len() || buf != *model {
            bail!("inode {} content diverged from the expected bytes", fh.ino());
        }
        let check = store.rebuild_index(fh.ino())?;
        if !check.matches_live {
            bail!("inode {} extent index does not match its log", fh.ino());
        }
        bytes_verified += n as u64;
    }

    let report = WorkloadReport {
        config: store.config().clone(),
        geometry: *store.geometry(),
        files: opts.files,
        writes: opts.writes,
        short_writes,
        bytes_written,
        bytes_verified,
        final_epoch: store.current_epoch().0,
        free_blocks: store.free_blocks(),
        stats: store.stats(),
    };
    tracing::info!(
        target: "efs::cli",
        writes = report.writes,
        bytes = report.bytes_written,
        "workload_finished"
    );

    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &WorkloadReport) {
    let s = &report.stats;
    println!("EpochFS workload");
    println!("strategy: {:?}", report.config.write_strategy());
    println!("files: {}  writes: {}  short writes: {}", report.files, report.writes, report.short_writes);
    println!("bytes written: {}  verified: {}", report.bytes_written, report.bytes_verified);
    println!("final epoch: {}  free blocks: {}", report.final_epoch, report.free_blocks);
    println!(
        "cow: {} calls, {} bytes, {} breaks",
        s.cow_write_calls, s.cow_write_bytes, s.cow_write_breaks
    );
    println!(
        "in-place: {} calls, {} bytes, {} breaks",
        s.inplace_write_calls, s.inplace_write_bytes, s.inplace_write_breaks
    );
    println!("reads: {} calls, {} bytes", s.read_calls, s.read_bytes);
    println!(
        "reclaimed: {} blocks, {} dead entries",
        s.freed_blocks, s.dead_entries
    );
    println!("inode persists: {}", s.inode_persists);
    println!("corruption detected: {}", s.corruption_detected);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn flags_override_defaults() {
        let opts = parse_options(args(&[
            "--in-place",
            "--checksum",
            "--blocks",
            "512",
            "--writes",
            "10",
            "--json",
        ]))
        .unwrap();
        assert!(opts.config.in_place_writes);
        assert!(opts.config.data_checksum);
        assert_eq!(opts.blocks, 512);
        assert_eq!(opts.writes, 10);
        assert!(opts.json);
    }

    #[test]
    fn config_file_is_loaded_before_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_parity": true, "strip_size": 1024}"#).unwrap();
        let path = path.to_string_lossy().into_owned();

        let opts = parse_options(args(&["--in-place", "--config", &path])).unwrap();
        assert!(opts.config.data_parity);
        assert!(opts.config.in_place_writes);
        assert_eq!(opts.config.strip_size, 1024);
    }

    #[test]
    fn bad_flags_rejected() {
        assert!(parse_options(args(&["--blocks"])).is_err());
        assert!(parse_options(args(&["--blocks", "many"])).is_err());
        assert!(parse_options(args(&["--frobnicate"])).is_err());
        assert!(parse_options(args(&["--files", "0"])).is_err());
    }

    #[test]
    fn small_workload_verifies() {
        let opts = Options {
            blocks: 1024,
            writes: 64,
            max_write: 6000,
            epoch_every: 8,
            config: StoreConfig {
                in_place_writes: true,
                data_checksum: true,
                data_parity: true,
                ..StoreConfig::default()
            },
            ..Options::default()
        };
        workload(&opts).unwrap();
    }
}
