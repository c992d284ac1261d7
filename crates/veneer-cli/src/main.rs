#![forbid(unsafe_code)]
//! veneer — expose pre-existing files as a synthetic removable-media image.
//!
//! File contents are never copied: source extents are stitched into the
//! target by reference, and only the filesystem metadata (ISO-9660+Joliet,
//! HFSX, FAT32 or none at all) is generated into a scratch medium.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use veneer_burn::{Burner, FileBurner, TempBurner, ZramBurner};
use veneer_error::VeneerError;
use veneer_extent::NoLocator;
use veneer_fat32::VFat32Out;
use veneer_hfsplus::HfsPlusOut;
use veneer_iso9660::Cd9660Out;
use veneer_source::Original;
use veneer_volume::{represent, RawFilesOut, Volume};

const DEFAULT_SYSTEM: &str = "VENEER_OS";
const GAP_MAPPED: i64 = 1 << 30;
const GAP_FILE: i64 = 32 << 20;

#[derive(Parser)]
#[command(
    name = "veneer",
    about = "Build a synthetic removable-media image over existing files"
)]
struct Cli {
    /// Source paths: the first is the root folder, the rest are extra
    /// entries placed under it.
    entries: Vec<PathBuf>,

    /// Target: a device-mapper name (no leading '/') or a regular file path.
    #[arg(long)]
    trg: Option<String>,

    /// Scratch file path; an anonymous memory-backed file when absent.
    #[arg(long)]
    tmp: Option<PathBuf>,

    /// Compressible-RAM sysfs control directory; makes --tmp a zram node.
    #[arg(long = "zram-control")]
    zram_control: Option<PathBuf>,

    /// Filesystems to emit: comma set of files, fat32, cdfs, hfsx
    /// (cdfs,hfsx builds the hybrid).
    #[arg(long)]
    mkfs: Option<String>,

    /// Volume label, repeatable; the n-th label applies to the n-th --mkfs
    /// entry.
    #[arg(long)]
    label: Vec<String>,

    /// Substitute a source device: <found>=<used>, path or major:minor.
    #[arg(long)]
    subst: Vec<String>,

    /// Skip entries whose names match the pattern (repeatable).
    #[arg(long)]
    exclude: Vec<String>,

    /// Explicit root folder prepended before the positional entries.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Extra roots, comma separated.
    #[arg(long, value_delimiter = ',')]
    include: Vec<PathBuf>,

    /// Extent merge tolerance in bytes (accepts K/M/G suffixes).
    #[arg(long)]
    gap: Option<String>,

    /// Power-of-two FAT lane count; laning is diagnostic only.
    #[arg(long, default_value_t = 1)]
    lanes: i64,

    /// Pack small extents together (scaffolded).
    #[arg(long = "wipe-dust")]
    wipe_dust: bool,

    /// Renumber inodes sequentially instead of preserving them.
    #[arg(long = "jam-inodes")]
    jam_inodes: bool,

    /// Keep file descriptors and mappings, wait for SIGTERM after commit.
    #[arg(long, alias = "wait-term")]
    daemonize: bool,

    /// Set a property on completion: <key>=<value> (repeatable).
    #[arg(long)]
    setprop: Vec<String>,

    /// Redirect the run summary to a file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Redirect diagnostics to a file.
    #[arg(long)]
    err: Option<PathBuf>,

    /// Byte budget for copying unmappable ranges into scratch.
    #[arg(long = "foster-budget")]
    foster_budget: Option<String>,

    /// Close source descriptors eagerly instead of raising the fd limit.
    #[arg(long)]
    crawl: bool,

    /// Favor free space in allocation tables (scratch partitions).
    #[arg(long)]
    sparse: bool,

    /// Extra free room to reserve beyond the source files.
    #[arg(long)]
    size: Option<String>,

    /// Emit the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FsMask(u32);

impl FsMask {
    const FILES: u32 = 1 << 0;
    const FAT32: u32 = 1 << 1;
    const CDFS: u32 = 1 << 2;
    const HFSX: u32 = 1 << 3;

    fn parse(text: &str) -> Result<Self> {
        let mut mask = 0;
        for token in text.split(',') {
            mask |= match token.trim() {
                "files" => Self::FILES,
                "fat32" => Self::FAT32,
                "cdfs" => Self::CDFS,
                "hfsx" => Self::HFSX,
                other => bail!("unknown filesystem: {other}"),
            };
        }
        let supported = [
            Self::FILES,
            Self::FAT32,
            Self::CDFS,
            Self::HFSX,
            Self::CDFS | Self::HFSX,
        ];
        if !supported.contains(&mask) {
            return Err(VeneerError::UnsupportedFilesystem { mask }.into());
        }
        Ok(Self(mask))
    }

    fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (bit, name) in [
            (Self::FILES, "files"),
            (Self::FAT32, "fat32"),
            (Self::CDFS, "cdfs"),
            (Self::HFSX, "hfsx"),
        ] {
            if self.0 & bit != 0 {
                out.push(name);
            }
        }
        out
    }
}

/// Accepts plain byte counts and K/M/G-suffixed values.
fn parse_size(text: &str) -> Result<i64> {
    let trimmed = text.trim();
    let (digits, shift) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 10),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 20),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 30),
        _ => (trimmed, 0),
    };
    let value: i64 = digits
        .parse()
        .with_context(|| format!("not a byte count: {text}"))?;
    Ok(value << shift)
}

#[derive(Serialize)]
struct RunSummary {
    files: usize,
    directories: usize,
    backing_devices: usize,
    payload_bytes: i64,
    filesystems: Vec<&'static str>,
    target: Option<String>,
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error:#}");
            match error.downcast_ref::<VeneerError>() {
                Some(veneer) => veneer.exit_code(),
                None => 1,
            }
        }
    };
    std::process::exit(code);
}

fn init_diagnostics(err: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match err {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_diagnostics(cli.err.as_deref())?;

    if cli.lanes <= 0 || cli.lanes & (cli.lanes - 1) != 0 {
        return Err(VeneerError::LaneCount(cli.lanes).into());
    }
    if cli.lanes > 1 {
        warn!(lanes = cli.lanes, "laning is scaffolded and not applied");
    }
    if cli.lanes > 4 {
        warn!("lane counts above 4 gain nothing on FAT alignment");
    }
    if cli.wipe_dust {
        warn!("--wipe-dust is scaffolded and not applied");
    }

    let size = cli.size.as_deref().map(parse_size).transpose()?.unwrap_or(0);
    let mut roots: Vec<PathBuf> = Vec::new();
    roots.extend(cli.root.clone());
    roots.extend(cli.entries.clone());
    roots.extend(cli.include.clone());
    if roots.is_empty() && size == 0 {
        bail!("no source paths given");
    }

    if !cli.crawl {
        raise_fd_limit();
    }

    let mapped = cli
        .trg
        .as_deref()
        .map(|t| !t.starts_with('/'))
        .unwrap_or(false);
    let gap = match cli.gap.as_deref() {
        Some(text) => parse_size(text)?,
        None => {
            if mapped {
                GAP_MAPPED
            } else {
                GAP_FILE
            }
        }
    };

    // the platform extent-query and device-mapper bindings live outside
    // this workspace; without them only file-backed targets can be built
    if mapped {
        return Err(VeneerError::CannotOpen {
            what: "device-mapper control (no platform binding compiled in)".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        }
        .into());
    }

    if cli.foster_budget.is_some() {
        // the identity locator copies whole files; fostering only matters
        // when extents come from the kernel query
        warn!("--foster-budget has no effect on file-copy targets");
    }
    for pair in &cli.subst {
        let Some((found, used)) = pair.split_once('=') else {
            bail!("--subst expects <found>=<used>, got {pair}");
        };
        // surface substitution feeds the device map of an extent-query
        // locator; with the identity locator it is recorded and unused
        warn!(found, used, "surface substitution ignored on file-copy targets");
    }

    let mut tree = Original::new(Box::new(NoLocator));
    tree.geometry.gap = gap;
    tree.eager_close = cli.crawl;
    if !cli.exclude.is_empty() {
        let patterns: Vec<regex::Regex> = cli
            .exclude
            .iter()
            .map(|expr| regex::Regex::new(expr).with_context(|| format!("bad pattern: {expr}")))
            .collect::<Result<_>>()?;
        tree.set_name_filter(Box::new(move |name| {
            !patterns.iter().any(|pattern| pattern.is_match(name))
        }));
    }

    let mut roots_iter = roots.iter();
    let root = match roots_iter.next() {
        Some(first) => tree.open_root(first)?,
        None => tree.fake_root(),
    };
    for extra in roots_iter {
        tree.insert_stat(root, extra)?;
    }

    info!(
        files = tree.file_table.len(),
        directories = tree.path_table.len(),
        backing_devices = tree.geometry.plan.len(),
        "source tree charted"
    );

    let summary = RunSummary {
        files: tree.file_table.len(),
        directories: tree.path_table.len(),
        backing_devices: tree.geometry.plan.len(),
        payload_bytes: tree.geometry.total_length(),
        filesystems: cli
            .mkfs
            .as_deref()
            .map(FsMask::parse)
            .transpose()?
            .map(FsMask::names)
            .unwrap_or_default(),
        target: cli.trg.clone(),
    };

    if let (Some(target), Some(mkfs)) = (cli.trg.as_deref(), cli.mkfs.as_deref()) {
        let mask = FsMask::parse(mkfs)?;
        build_target(&cli, &mut tree, target, mask, size)?;
    }

    emit_summary(&cli, &summary)?;

    for assignment in &cli.setprop {
        // system properties are an Android notion; the stub keeps the
        // contract visible on other platforms
        warn!(property = %assignment, "property setting unsupported here");
    }

    if cli.daemonize {
        info!("holding descriptors until SIGTERM");
        loop {
            std::thread::park();
        }
    }
    Ok(())
}

fn build_target(
    cli: &Cli,
    tree: &mut Original,
    target: &str,
    mask: FsMask,
    size: i64,
) -> Result<()> {
    let out_image: Box<dyn Burner> = Box::new(FileBurner::create(Path::new(target))?);
    let tmp_image: Box<dyn Burner> = match (&cli.zram_control, &cli.tmp) {
        (Some(control), Some(node)) => Box::new(ZramBurner::open(node, control)?),
        (None, Some(path)) if path.is_absolute() => Box::new(FileBurner::create(path)?),
        _ => Box::new(TempBurner::new(1)?),
    };

    let mut labels = cli.label.iter();
    let mut next_label = || labels.next().cloned().unwrap_or_default();

    let mut volume: Box<dyn Volume> = if mask.0 & FsMask::CDFS != 0 {
        let mut iso = Cd9660Out::new(true);
        iso.set_titles(DEFAULT_SYSTEM, &next_label());
        if mask.0 & FsMask::HFSX != 0 {
            let mut mac = HfsPlusOut::new();
            mac.set_jam_inodes(cli.jam_inodes);
            mac.set_titles(DEFAULT_SYSTEM, &next_label());
            iso.set_hybrid(Box::new(mac));
        }
        Box::new(iso)
    } else if mask.0 & FsMask::HFSX != 0 {
        let mut mac = HfsPlusOut::new();
        mac.set_jam_inodes(cli.jam_inodes);
        mac.set_titles(DEFAULT_SYSTEM, &next_label());
        Box::new(mac)
    } else if mask.0 & FsMask::FAT32 != 0 {
        let mut fat = VFat32Out::new();
        fat.set_titles(DEFAULT_SYSTEM, &next_label());
        if cli.sparse || size > 0 {
            fat.book_space(cli.sparse, false, size);
        }
        if fat.block_size() == 0 {
            fat.set_block_size(best_fat_block(size.max(tree.geometry.total_length())));
        }
        // file targets below 2k clusters confuse picky host drivers
        if fat.block_size() < 2048 {
            fat.set_block_size(2048);
        }
        Box::new(fat)
    } else {
        Box::new(RawFilesOut::default())
    };

    represent(volume.as_mut(), tree, out_image, tmp_image)?;
    info!(image = target, "image committed");
    Ok(())
}

/// Cluster-size ladder for scratch partitions: hosts misread 512-byte
/// clusters as FAT16, so start at 1k.
fn best_fat_block(size: i64) -> i64 {
    if size < (128 << 20) {
        1024
    } else if size < (256 << 20) {
        2048
    } else if size < (1 << 30) {
        4096
    } else if size < (1_i64 << 34) {
        8192
    } else {
        16384
    }
}

fn raise_fd_limit() {
    let wanted = std::fs::read_to_string("/proc/sys/fs/file-max")
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .unwrap_or(u64::MAX);
    match rlimit::Resource::NOFILE.get() {
        Ok((soft, hard)) if wanted > soft => {
            let target = wanted.min(hard.max(soft));
            if let Err(error) = rlimit::Resource::NOFILE.set(target, hard.max(target)) {
                warn!(%error, "could not raise the descriptor limit");
            } else {
                info!(from = soft, to = target, "descriptor limit raised");
            }
        }
        Ok(_) => {}
        Err(error) => warn!(%error, "descriptor limit unavailable"),
    }
}

fn emit_summary(cli: &Cli, summary: &RunSummary) -> Result<()> {
    let text = if cli.json {
        serde_json::to_string_pretty(summary)?
    } else {
        format!(
            "Files: {}\nFolders: {}\nBacking devices: {}\nPayload bytes: {}\n",
            summary.files, summary.directories, summary.backing_devices, summary.payload_bytes
        )
    };
    match &cli.out {
        Some(path) => std::fs::write(path, text.as_bytes())
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => print!("{text}"),
    }
    if cli.json && cli.out.is_none() {
        println!();
    }
    Ok(())
}
