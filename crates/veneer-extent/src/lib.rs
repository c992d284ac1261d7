#![forbid(unsafe_code)]
//! Media, extents and the source extent locator.
//!
//! A `Medium` is a block-delimited byte store; an `Extent` is a range within
//! one. The locator resolves a logical file range into the physical extents
//! backing it, escalating Naive -> Fsync -> Foster -> Blank so that the
//! pipeline never aborts on an unmappable range — it degrades to zeroes and
//! reports on the diagnostic stream.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use veneer_types::{DevNum, MediumId, Range, MAPPER_SECTOR};

// ── Fill rules ──────────────────────────────────────────────────────────────

/// A deferred write into algorithmically generated content, keyed by byte
/// offset within the medium. Applied after the default generator fills a
/// chunk; amendments are deterministic and order-independent within a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Amendment {
    U32Le(u32),
    Bytes(Vec<u8>),
}

impl Amendment {
    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::U32Le(v) => v.to_le_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
        }
    }
}

/// Content generated by rule rather than stored.
pub trait FillRule: Send + Sync {
    /// Generation buffer size; also the advertised block size of the medium.
    fn chunk_size(&self) -> usize;

    /// Produce the default contents of `chunk` at `offset` within the medium.
    fn fill(&self, chunk: &mut [u8], offset: i64);

    /// Sorted snapshot of the amendment map.
    fn amendments(&self) -> Vec<(i64, Amendment)> {
        Vec::new()
    }
}

/// A rule medium that fills with `1` bits: 0xFF up to `bits / 8` bytes, a
/// partial `0xFF00 >> (bits % 8)` byte, then zeroes. Used for the HFS+
/// allocation file and B-tree map records; the bit count may be revised
/// until the medium is burned.
pub struct BitsFill {
    chunk: usize,
    bits: Mutex<i64>,
}

impl BitsFill {
    #[must_use]
    pub fn new(chunk: usize, bits: i64) -> Self {
        Self {
            chunk,
            bits: Mutex::new(bits),
        }
    }

    pub fn reserve_bits(&self, bits: i64) {
        *self.bits.lock() = bits;
    }

    #[must_use]
    pub fn bits(&self) -> i64 {
        *self.bits.lock()
    }

    /// Bytes needed to hold the bitmap, trailing partial byte included.
    #[must_use]
    pub fn byte_count(&self) -> i64 {
        (self.bits() + 7) / 8
    }
}

impl FillRule for BitsFill {
    fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn fill(&self, chunk: &mut [u8], offset: i64) {
        let bits = self.bits();
        let full = bits / 8;
        let partial = bits % 8;
        for (i, byte) in chunk.iter_mut().enumerate() {
            let pos = offset + i as i64;
            *byte = if pos < full {
                0xff
            } else if pos == full && partial != 0 {
                (0xff00_u16 >> partial) as u8
            } else {
                0
            };
        }
    }
}

// ── Medium ──────────────────────────────────────────────────────────────────

/// The closed set of concrete backings behind a `Medium`.
pub enum Backing {
    /// Reads as zeroes; writes become sparse holes where the sink allows.
    Zero,
    /// Immutable in-memory contents.
    Bytes(Arc<[u8]>),
    /// Mutable in-memory contents finalized before burners flush. Used for
    /// header structures whose fields (total blocks, table locations) are
    /// only known at the end of planning.
    Shared(SharedBuf),
    /// An open file; `dev` is the block device backing it, if known.
    File { file: Arc<File>, dev: Option<DevNum> },
    /// A raw block device addressed by number only — mappable, not readable
    /// without a platform binding.
    Device { dev: DevNum },
    /// Algorithmic content plus sparse amendments.
    Rule(Arc<dyn FillRule>),
}

/// A mutable buffer shared between a planned extent and the code that fills
/// it in later. The length is fixed at creation.
#[derive(Clone)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the buffer contents. The replacement must match the planned
    /// length exactly.
    pub fn fill(&self, bytes: &[u8]) {
        let mut guard = self.0.lock();
        assert_eq!(guard.len(), bytes.len(), "shared buffer length is fixed");
        guard.copy_from_slice(bytes);
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut guard = self.0.lock();
        guard[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Grow the buffer. Only meaningful for buffers that serve as append
    /// sinks (the vector burner); fixed header buffers never grow.
    pub fn extend(&self, bytes: &[u8]) {
        self.0.lock().extend_from_slice(bytes);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

struct MediumInner {
    id: MediumId,
    block_size: i64,
    aligned: bool,
    direct: bool,
    backing: Backing,
}

/// A refcounted block-delimited byte store shared by many extents.
#[derive(Clone)]
pub struct Medium {
    inner: Arc<MediumInner>,
}

impl Medium {
    fn build(id: MediumId, block_size: i64, aligned: bool, direct: bool, backing: Backing) -> Self {
        Self {
            inner: Arc::new(MediumInner {
                id,
                block_size,
                aligned,
                direct,
                backing,
            }),
        }
    }

    /// The no-medium: reads back as zeroes.
    #[must_use]
    pub fn zero() -> Self {
        Self::build(MediumId(0), MAPPER_SECTOR, false, false, Backing::Zero)
    }

    /// Immutable in-memory contents. `id` disambiguates synthetic media.
    #[must_use]
    pub fn bytes(id: MediumId, data: Vec<u8>) -> Self {
        Self::build(id, 1, false, false, Backing::Bytes(data.into()))
    }

    /// A deferred-fill buffer of fixed length.
    #[must_use]
    pub fn shared(id: MediumId, buf: SharedBuf) -> Self {
        Self::build(id, 1, false, false, Backing::Shared(buf))
    }

    /// A source or scratch file. `aligned` is false: file offsets carry no
    /// device alignment guarantee.
    #[must_use]
    pub fn file(id: MediumId, file: Arc<File>, dev: Option<DevNum>, block_size: i64) -> Self {
        Self::build(
            id,
            block_size.max(1),
            false,
            false,
            Backing::File { file, dev },
        )
    }

    /// An open block-device node that is itself mappable (zram scratch).
    #[must_use]
    pub fn direct_file(id: MediumId, file: Arc<File>, dev: DevNum, block_size: i64) -> Self {
        Self::build(
            id,
            block_size.max(MAPPER_SECTOR),
            true,
            true,
            Backing::File {
                file,
                dev: Some(dev),
            },
        )
    }

    /// A raw source block device.
    #[must_use]
    pub fn device(dev: DevNum, block_size: i64) -> Self {
        let block = if block_size > 0 {
            block_size
        } else {
            MAPPER_SECTOR
        };
        Self::build(
            MediumId(dev.to_raw()),
            block,
            true,
            true,
            Backing::Device { dev },
        )
    }

    /// Algorithmic content.
    #[must_use]
    pub fn rule(id: MediumId, rule: Arc<dyn FillRule>) -> Self {
        let block = rule.chunk_size() as i64;
        Self::build(id, block.max(1), false, false, Backing::Rule(rule))
    }

    #[must_use]
    pub fn id(&self) -> MediumId {
        self.inner.id
    }

    #[must_use]
    pub fn block_size(&self) -> i64 {
        self.inner.block_size
    }

    /// Whether offsets within this medium are device-block aligned.
    #[must_use]
    pub fn is_aligned(&self) -> bool {
        self.inner.aligned
    }

    /// Whether `block_device()` is the medium itself rather than backing
    /// storage — true for devices the mapper can reference directly.
    #[must_use]
    pub fn is_direct_device(&self) -> bool {
        self.inner.direct
    }

    #[must_use]
    pub fn block_device(&self) -> Option<DevNum> {
        match &self.inner.backing {
            Backing::File { dev, .. } => *dev,
            Backing::Device { dev } => Some(*dev),
            _ => None,
        }
    }

    #[must_use]
    pub fn backing(&self) -> &Backing {
        &self.inner.backing
    }

    #[must_use]
    pub fn source_file(&self) -> Option<Arc<File>> {
        match &self.inner.backing {
            Backing::File { file, .. } => Some(Arc::clone(file)),
            _ => None,
        }
    }

    /// Write `range` of this medium into `out` at its current position.
    pub fn write_range_to(&self, mut out: &File, range: Range) -> io::Result<()> {
        match &self.inner.backing {
            Backing::Zero => write_zeroes(out, range.length),
            Backing::Bytes(data) => {
                let lo = range.offset as usize;
                let hi = (range.offset + range.length) as usize;
                out.write_all(&data[lo..hi])
            }
            Backing::Shared(buf) => {
                let snap = buf.snapshot();
                let lo = range.offset as usize;
                let hi = (range.offset + range.length) as usize;
                out.write_all(&snap[lo..hi])
            }
            Backing::File { file, .. } => copy_file_range(file, out, range),
            Backing::Device { dev } => Err(io::Error::other(format!(
                "device {dev} is mappable, not readable"
            ))),
            Backing::Rule(rule) => write_rule_range(rule.as_ref(), out, range),
        }
    }

    /// Materialize `range` as owned bytes. File-backed media read from disk;
    /// raw devices cannot be materialized.
    pub fn read_range(&self, range: Range) -> io::Result<Vec<u8>> {
        let len = range.length as usize;
        match &self.inner.backing {
            Backing::Zero => Ok(vec![0; len]),
            Backing::Bytes(data) => {
                let lo = range.offset as usize;
                Ok(data[lo..lo + len].to_vec())
            }
            Backing::Shared(buf) => {
                let snap = buf.snapshot();
                let lo = range.offset as usize;
                Ok(snap[lo..lo + len].to_vec())
            }
            Backing::File { file, .. } => {
                let mut buf = vec![0; len];
                file.read_exact_at(&mut buf, range.offset as u64)?;
                Ok(buf)
            }
            Backing::Device { dev } => Err(io::Error::other(format!(
                "device {dev} is mappable, not readable"
            ))),
            Backing::Rule(rule) => {
                let mut buf = vec![0; len];
                fill_rule_into(rule.as_ref(), &mut buf, range);
                Ok(buf)
            }
        }
    }
}

impl std::fmt::Debug for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner.backing {
            Backing::Zero => "zero",
            Backing::Bytes(_) => "bytes",
            Backing::Shared(_) => "shared",
            Backing::File { .. } => "file",
            Backing::Device { .. } => "device",
            Backing::Rule(_) => "rule",
        };
        f.debug_struct("Medium")
            .field("id", &self.inner.id)
            .field("kind", &kind)
            .field("block_size", &self.inner.block_size)
            .finish()
    }
}

fn write_zeroes(mut out: &File, length: i64) -> io::Result<()> {
    if length < 0 {
        return Err(io::Error::other("negative zero-fill length"));
    }
    if length == 0 {
        return Ok(());
    }
    let pos = out.seek(SeekFrom::Current(length))?;
    // Regular files become sparse; block devices read back zeroes anyway
    // (scratch devices are reset before use), so a failed truncate is fine.
    if let Err(error) = out.set_len(pos) {
        trace!(target: "veneer::extent", event = "zero_fill_seek_only", %error);
    }
    Ok(())
}

fn copy_file_range(src: &Arc<File>, mut out: &File, range: Range) -> io::Result<()> {
    let mut remaining = range.length as u64;
    let mut pos = range.offset as u64;
    let mut buf = vec![0_u8; 1 << 16];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let got = src.read_at(&mut buf[..want], pos)?;
        if got == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "source file shorter than its extent",
            ));
        }
        out.write_all(&buf[..got])?;
        pos += got as u64;
        remaining -= got as u64;
    }
    Ok(())
}

fn write_rule_range(rule: &dyn FillRule, mut out: &File, range: Range) -> io::Result<()> {
    let base = out.stream_position()?;
    let chunk_size = rule.chunk_size().max(1);
    let mut chunk = vec![0_u8; chunk_size];
    let last = range.end();
    let mut next = range.offset;
    while next < last {
        let part = ((last - next) as usize).min(chunk_size);
        rule.fill(&mut chunk[..part], next);
        out.write_all(&chunk[..part])?;
        next += part as i64;
    }
    for (offset, amendment) in rule.amendments() {
        let bytes = amendment.as_bytes();
        if offset < range.offset || offset + bytes.len() as i64 > last {
            continue;
        }
        out.write_all_at(&bytes, base + (offset - range.offset) as u64)?;
    }
    out.seek(SeekFrom::Start(base + range.length as u64))?;
    Ok(())
}

fn fill_rule_into(rule: &dyn FillRule, buf: &mut [u8], range: Range) {
    let chunk_size = rule.chunk_size().max(1);
    let mut done = 0_usize;
    while done < buf.len() {
        let part = (buf.len() - done).min(chunk_size);
        rule.fill(&mut buf[done..done + part], range.offset + done as i64);
        done += part;
    }
    for (offset, amendment) in rule.amendments() {
        let bytes = amendment.as_bytes();
        let end = offset + bytes.len() as i64;
        if offset < range.offset || end > range.end() {
            continue;
        }
        let at = (offset - range.offset) as usize;
        buf[at..at + bytes.len()].copy_from_slice(&bytes);
    }
}

// ── Extent ──────────────────────────────────────────────────────────────────

/// A `Range` within a `Medium`. The basic unit of storage bookkeeping.
#[derive(Debug, Clone)]
pub struct Extent {
    pub range: Range,
    pub medium: Medium,
}

impl Extent {
    #[must_use]
    pub fn new(offset: i64, length: i64, medium: Medium) -> Self {
        Self {
            range: Range::new(offset, length),
            medium,
        }
    }

    /// A zero-filled extent of `length` bytes.
    #[must_use]
    pub fn zeroes(length: i64) -> Self {
        Self::new(0, length, Medium::zero())
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.range.offset
    }

    #[must_use]
    pub fn length(&self) -> i64 {
        self.range.length
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        self.range.end()
    }

    pub fn write_to(&self, out: &File) -> io::Result<()> {
        self.medium.write_range_to(out, self.range)
    }
}

pub type ExtentList = Vec<Extent>;

// ── Extent query contract ───────────────────────────────────────────────────

/// Range reported as unallocated or delayed-allocated.
pub const EXTENT_UNKNOWN: u32 = 1 << 0;
/// Range allocated but not yet flushed.
pub const EXTENT_UNWRITTEN: u32 = 1 << 1;
/// Range compressed or encrypted at rest.
pub const EXTENT_ENCODED: u32 = 1 << 2;
/// Range inlined or tail-packed; physical offset is meaningless.
pub const EXTENT_NOT_ALIGNED: u32 = 1 << 3;

/// One physical mapping reported by the kernel extent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub logical: i64,
    pub physical: i64,
    pub length: i64,
    pub flags: u32,
}

/// Platform contract for the kernel extent map query (fiemap on Linux).
/// `sync` asks the implementation to flush dirty pages before mapping.
pub trait ExtentQuery {
    fn map_range(&mut self, file: &Medium, range: Range, sync: bool) -> io::Result<Vec<RawExtent>>;
}

// ── Locators ────────────────────────────────────────────────────────────────

/// Resolves a single logical extent to physical extents on backing storage.
pub trait Locate {
    fn resolve(&mut self, source: &Extent) -> ExtentList;
}

/// Identity locator: the virtual device is a regular file and source bytes
/// are copied into it, so the logical extent maps to itself.
pub struct NoLocator;

impl Locate for NoLocator {
    fn resolve(&mut self, source: &Extent) -> ExtentList {
        vec![source.clone()]
    }
}

/// Copies unmappable ranges into a bounded scratch area and re-exposes them
/// from there. Implemented over a planner in the burn layer.
pub trait Adopt {
    /// `Some(extent)` backed by the scratch medium, or `None` when the copy
    /// would exceed the adoption budget.
    fn adopt(&mut self, source: &Extent) -> Option<Extent>;
}

/// Maps mounted source devices to their unmounted mirror ("surface")
/// devices — the device mapper cannot reference mounted drives — and caches
/// one medium per surface.
#[derive(Default)]
pub struct DeviceMap {
    substitute: std::collections::BTreeMap<u64, u64>,
    media: std::collections::BTreeMap<u64, Medium>,
}

impl DeviceMap {
    pub fn substitute(&mut self, found: u64, used: u64) {
        self.substitute.insert(found, used);
    }

    /// The surface medium for a mounted device, creating it on first use.
    pub fn surface(&mut self, dev: u64, block_size: i64) -> Medium {
        let surface = *self.substitute.get(&dev).unwrap_or(&dev);
        self.media
            .entry(dev)
            .or_insert_with(|| Medium::device(DevNum::from_raw(surface), block_size))
            .clone()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Correction {
    Naive,
    Fsync,
}

/// The production locator: queries the kernel extent map and escalates per
/// extent. Degradations are logged, never fatal.
pub struct QueryLocator<Q: ExtentQuery> {
    query: Q,
    pub devices: DeviceMap,
    foster: Option<Box<dyn Adopt>>,
    waitlist: Vec<Arc<File>>,
}

impl<Q: ExtentQuery> QueryLocator<Q> {
    pub fn new(query: Q) -> Self {
        Self {
            query,
            devices: DeviceMap::default(),
            foster: None,
            waitlist: Vec::new(),
        }
    }

    /// Attach a foster scratch for ranges the query cannot map.
    pub fn with_foster(mut self, foster: Box<dyn Adopt>) -> Self {
        self.foster = Some(foster);
        self
    }

    /// Files whose extents were reported unwritten; the caller syncs them
    /// best-effort once planning is done.
    pub fn take_waitlist(&mut self) -> Vec<Arc<File>> {
        std::mem::take(&mut self.waitlist)
    }

    fn peek(&mut self, source: &Extent, correction: Correction) -> io::Result<ExtentList> {
        let medium = self.devices.surface(
            source
                .medium
                .block_device()
                .map(DevNum::to_raw)
                .unwrap_or(0),
            source.medium.block_size(),
        );
        let raw = self
            .query
            .map_range(&source.medium, source.range, correction == Correction::Fsync)?;

        let mut out = ExtentList::new();
        for rx in raw {
            let mut cant_map = false;

            if rx.flags & EXTENT_UNKNOWN != 0 {
                if correction != Correction::Fsync {
                    return self.peek(source, Correction::Fsync);
                }
                warn!(
                    target: "veneer::extent",
                    logical = rx.logical,
                    length = rx.length,
                    "logical extent unallocated after fsync"
                );
                cant_map = true;
            }

            if rx.flags & (EXTENT_ENCODED | EXTENT_NOT_ALIGNED) != 0 {
                warn!(
                    target: "veneer::extent",
                    logical = rx.logical,
                    length = rx.length,
                    "logical extent inlined or encoded"
                );
                cant_map = true;
            }

            if cant_map {
                let logical = Extent::new(rx.logical, rx.length, source.medium.clone());
                match self.foster.as_mut().and_then(|f| f.adopt(&logical)) {
                    Some(adopted) => {
                        debug!(
                            target: "veneer::extent",
                            logical = rx.logical,
                            length = rx.length,
                            "range fostered into scratch"
                        );
                        out.push(adopted);
                    }
                    None => {
                        // Never expose uninitialized storage: the image
                        // reads zeroes for the range instead.
                        warn!(
                            target: "veneer::extent",
                            logical = rx.logical,
                            length = rx.length,
                            "adoption budget exceeded, substituting zeroes"
                        );
                        out.push(Extent::new(0, rx.length, Medium::zero()));
                    }
                }
                continue;
            }

            if rx.flags & EXTENT_UNWRITTEN != 0 {
                debug!(
                    target: "veneer::extent",
                    physical = rx.physical,
                    length = rx.length,
                    "physical extent not yet written, queued for sync"
                );
                if let Some(file) = source.medium.source_file() {
                    self.waitlist.push(file);
                }
            }

            out.push(Extent::new(rx.physical, rx.length, medium.clone()));
        }
        Ok(out)
    }
}

impl<Q: ExtentQuery> Locate for QueryLocator<Q> {
    fn resolve(&mut self, source: &Extent) -> ExtentList {
        match self.peek(source, Correction::Naive) {
            Ok(list) => list,
            Err(error) => {
                warn!(
                    target: "veneer::extent",
                    range = %source.range,
                    %error,
                    "extent query failed, substituting zeroes"
                );
                vec![Extent::new(0, source.length(), Medium::zero())]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    struct ScriptedQuery {
        script: Vec<(bool, Vec<RawExtent>)>,
        calls: usize,
    }

    impl ExtentQuery for ScriptedQuery {
        fn map_range(
            &mut self,
            _file: &Medium,
            _range: Range,
            sync: bool,
        ) -> io::Result<Vec<RawExtent>> {
            let (want_sync, out) = &self.script[self.calls.min(self.script.len() - 1)];
            self.calls += 1;
            assert_eq!(sync, *want_sync, "unexpected sync hint at call {}", self.calls);
            Ok(out.clone())
        }
    }

    struct FixedFoster {
        budget: i64,
        used: i64,
    }

    impl Adopt for FixedFoster {
        fn adopt(&mut self, source: &Extent) -> Option<Extent> {
            if self.used + source.length() > self.budget {
                return None;
            }
            let at = self.used;
            self.used += source.length();
            Some(Extent::new(
                at,
                source.length(),
                Medium::bytes(MediumId(0x5c7a7c4), vec![0xaa; source.length() as usize]),
            ))
        }
    }

    fn file_medium(len: usize) -> Medium {
        let mut tmp = tempfile::tempfile().expect("tempfile");
        tmp.write_all(&vec![7_u8; len]).expect("fill");
        Medium::file(MediumId(42), Arc::new(tmp), Some(DevNum::from_raw(0x801)), 4096)
    }

    #[test]
    fn unknown_retries_with_fsync_then_maps() {
        let query = ScriptedQuery {
            script: vec![
                (
                    false,
                    vec![RawExtent {
                        logical: 0,
                        physical: 0,
                        length: 4096,
                        flags: EXTENT_UNKNOWN,
                    }],
                ),
                (
                    true,
                    vec![RawExtent {
                        logical: 0,
                        physical: 0x10000,
                        length: 4096,
                        flags: 0,
                    }],
                ),
            ],
            calls: 0,
        };
        let mut locator = QueryLocator::new(query);
        let source = Extent::new(0, 4096, file_medium(4096));
        let resolved = locator.resolve(&source);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].offset(), 0x10000);
        assert!(resolved[0].medium.is_aligned());
    }

    #[test]
    fn encoded_goes_to_foster_within_budget() {
        let query = ScriptedQuery {
            script: vec![(
                false,
                vec![RawExtent {
                    logical: 0,
                    physical: 0,
                    length: 512,
                    flags: EXTENT_ENCODED,
                }],
            )],
            calls: 0,
        };
        let mut locator = QueryLocator::new(query).with_foster(Box::new(FixedFoster {
            budget: 1024,
            used: 0,
        }));
        let resolved = locator.resolve(&Extent::new(0, 512, file_medium(512)));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].medium.read_range(resolved[0].range).unwrap(), vec![0xaa; 512]);
    }

    #[test]
    fn over_budget_degrades_to_zeroes() {
        let query = ScriptedQuery {
            script: vec![(
                false,
                vec![RawExtent {
                    logical: 0,
                    physical: 0,
                    length: 2048,
                    flags: EXTENT_NOT_ALIGNED,
                }],
            )],
            calls: 0,
        };
        let mut locator = QueryLocator::new(query).with_foster(Box::new(FixedFoster {
            budget: 1024,
            used: 0,
        }));
        let resolved = locator.resolve(&Extent::new(0, 2048, file_medium(2048)));
        assert_eq!(resolved.len(), 1);
        assert!(matches!(resolved[0].medium.backing(), Backing::Zero));
        assert_eq!(resolved[0].length(), 2048);
    }

    #[test]
    fn unwritten_is_accepted_and_waitlisted() {
        let query = ScriptedQuery {
            script: vec![(
                false,
                vec![RawExtent {
                    logical: 0,
                    physical: 0x8000,
                    length: 4096,
                    flags: EXTENT_UNWRITTEN,
                }],
            )],
            calls: 0,
        };
        let mut locator = QueryLocator::new(query);
        let resolved = locator.resolve(&Extent::new(0, 4096, file_medium(4096)));
        assert_eq!(resolved[0].offset(), 0x8000);
        assert_eq!(locator.take_waitlist().len(), 1);
    }

    #[test]
    fn bits_fill_pattern() {
        let rule = BitsFill::new(512, 11);
        let mut buf = vec![0xcc_u8; 8];
        rule.fill(&mut buf, 0);
        // 11 bits: one full 0xFF byte, then 0xff00 >> 3 = 0xE0, then zeroes.
        assert_eq!(buf, [0xff, 0xe0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(rule.byte_count(), 2);
    }

    #[test]
    fn rule_amendments_apply_in_materialized_reads() {
        struct Seq;
        impl FillRule for Seq {
            fn chunk_size(&self) -> usize {
                4
            }
            fn fill(&self, chunk: &mut [u8], offset: i64) {
                for (i, b) in chunk.iter_mut().enumerate() {
                    *b = (offset as u8).wrapping_add(i as u8);
                }
            }
            fn amendments(&self) -> Vec<(i64, Amendment)> {
                vec![(4, Amendment::U32Le(0xdead_beef))]
            }
        }
        let medium = Medium::rule(MediumId(9), Arc::new(Seq));
        let bytes = medium.read_range(Range::new(0, 12)).unwrap();
        assert_eq!(&bytes[0..4], &[0, 1, 2, 3]);
        assert_eq!(&bytes[4..8], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[8, 9, 10, 11]);
    }

    #[test]
    fn zero_extent_reads_back_zeroes() {
        let xt = Extent::zeroes(16);
        assert_eq!(xt.medium.read_range(xt.range).unwrap(), vec![0; 16]);
    }
}
