#![forbid(unsafe_code)]
//! Burners and the planner.
//!
//! A `Burner` writes a sequence of extents to a medium — the way files
//! dropped on a CD-burning window end up on the disc. A `Planner` collects
//! extents first and commits them to its burner in one transaction,
//! maintaining block padding and the running offset.

use std::fs::{File, OpenOptions};
use std::io::Seek;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use veneer_error::{Result, VeneerError};
use veneer_extent::{Adopt, Extent, Medium, SharedBuf};
use veneer_types::{padding, round_up, DevNum, MediumId, MAPPER_SECTOR};

/// Monotonic ids for synthetic media created by burners.
static NEXT_MEDIUM_ID: AtomicU64 = AtomicU64::new(0x1000_0000);

fn fresh_medium_id() -> MediumId {
    MediumId(NEXT_MEDIUM_ID.fetch_add(1, Ordering::Relaxed))
}

// ── Burner contract ─────────────────────────────────────────────────────────

/// An append-only extent sink that can describe itself as a medium and
/// commit to an underlying storage.
pub trait Burner {
    /// Native block size of the backing storage.
    fn block_size(&self) -> i64;

    /// Whether the backing storage was successfully acquired.
    fn is_valid(&self) -> bool;

    /// Current write position; the next appended extent lands here.
    fn offset(&self) -> i64;

    /// Allocate the needed space on the backing medium.
    fn reserve(&mut self, _size: i64) -> Result<()> {
        Ok(())
    }

    /// Write one extent; returns its placement offset.
    fn append(&mut self, extent: &Extent) -> Result<i64>;

    /// Flush the backing storage.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// This burner's storage described as a medium, so that ranges of it
    /// can be re-exposed as extents on another target.
    fn as_medium(&self) -> Medium;
}

// ── Byte-vector burner ──────────────────────────────────────────────────────

/// A burner backed by a growable in-memory buffer; used for directory data
/// and other small metadata runs assembled before placement.
pub struct VecBurner {
    buf: SharedBuf,
    id: MediumId,
    block: i64,
}

impl VecBurner {
    #[must_use]
    pub fn new(block: i64) -> Self {
        Self {
            buf: SharedBuf::new(0),
            id: fresh_medium_id(),
            block: block.max(1),
        }
    }

    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.buf.snapshot()
    }
}

impl Burner for VecBurner {
    fn block_size(&self) -> i64 {
        self.block
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn offset(&self) -> i64 {
        self.buf.len() as i64
    }

    fn append(&mut self, extent: &Extent) -> Result<i64> {
        let cur = self.offset();
        let bytes = extent.medium.read_range(extent.range)?;
        self.buf.extend(&bytes);
        Ok(cur)
    }

    fn as_medium(&self) -> Medium {
        Medium::shared(self.id, self.buf.clone())
    }
}

// ── File burner ─────────────────────────────────────────────────────────────

/// A burner backed by a regular file. Behaves like a character device:
/// one-byte blocks.
pub struct FileBurner {
    file: Arc<File>,
    id: MediumId,
    dev: Option<DevNum>,
    block: i64,
    path: Option<PathBuf>,
}

impl FileBurner {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| VeneerError::CannotOpen {
                what: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            file: Arc::new(file),
            id: fresh_medium_id(),
            dev: None,
            block: 1,
            path: Some(path.to_path_buf()),
        })
    }

    #[must_use]
    pub fn from_file(file: File, block: i64) -> Self {
        Self {
            file: Arc::new(file),
            id: fresh_medium_id(),
            dev: None,
            block: block.max(1),
            path: None,
        }
    }

    #[must_use]
    pub fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Burner for FileBurner {
    fn block_size(&self) -> i64 {
        self.block
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn offset(&self) -> i64 {
        let mut file: &File = &self.file;
        file.stream_position().map(|p| p as i64).unwrap_or(0)
    }

    fn append(&mut self, extent: &Extent) -> Result<i64> {
        let placement = self.offset();
        if extent.length() != 0 {
            extent.write_to(&self.file)?;
        }
        Ok(placement)
    }

    fn commit(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn as_medium(&self) -> Medium {
        Medium::file(self.id, Arc::clone(&self.file), self.dev, self.block)
    }
}

/// A burner backed by an anonymous temporary file — the memory-resident
/// scratch used when no explicit `--tmp` path or zram device is given.
pub struct TempBurner(FileBurner);

impl TempBurner {
    pub fn new(block: i64) -> Result<Self> {
        let file = tempfile::tempfile().map_err(|source| VeneerError::CannotOpen {
            what: "anonymous scratch file".to_string(),
            source,
        })?;
        Ok(Self(FileBurner::from_file(file, block)))
    }
}

impl Burner for TempBurner {
    fn block_size(&self) -> i64 {
        self.0.block_size()
    }

    fn is_valid(&self) -> bool {
        self.0.is_valid()
    }

    fn offset(&self) -> i64 {
        self.0.offset()
    }

    fn append(&mut self, extent: &Extent) -> Result<i64> {
        self.0.append(extent)
    }

    fn commit(&mut self) -> Result<()> {
        self.0.commit()
    }

    fn as_medium(&self) -> Medium {
        self.0.as_medium()
    }
}

// ── Compressible-RAM burner ─────────────────────────────────────────────────

/// A burner backed by a compressible-RAM block device (zram). Scratch data
/// written here is mappable by the device-mapper linear target.
///
/// The sysfs control directory drives sizing: `reserve` closes the node,
/// writes `1` to `reset` and the rounded byte count to `disksize`, then
/// reopens the node.
pub struct ZramBurner {
    dev_node: PathBuf,
    sys_path: PathBuf,
    file: Option<Arc<File>>,
    dev: DevNum,
    block: i64,
    id: MediumId,
}

impl ZramBurner {
    pub fn open(dev_node: &Path, sys_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_node)
            .map_err(|source| VeneerError::CannotOpen {
                what: dev_node.display().to_string(),
                source,
            })?;
        let meta = file.metadata()?;
        let dev = DevNum::from_raw(std::os::unix::fs::MetadataExt::rdev(&meta));
        let block = read_sysfs_number(&sys_path.join("queue/logical_block_size")).unwrap_or(4096);
        Ok(Self {
            dev_node: dev_node.to_path_buf(),
            sys_path: sys_path.to_path_buf(),
            file: Some(Arc::new(file)),
            dev,
            block,
            id: fresh_medium_id(),
        })
    }

    fn set_attr(&self, attr: &str, value: &str) -> Result<()> {
        let path = self.sys_path.join(attr);
        std::fs::write(&path, value).map_err(|source| VeneerError::CannotOpen {
            what: path.display().to_string(),
            source,
        })
    }

    fn node(&self) -> Result<&Arc<File>> {
        self.file
            .as_ref()
            .ok_or_else(|| VeneerError::assertion("zram node not open"))
    }
}

fn read_sysfs_number(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()
}

impl Burner for ZramBurner {
    fn block_size(&self) -> i64 {
        self.block
    }

    fn is_valid(&self) -> bool {
        self.block != 0 && self.file.is_some()
    }

    fn offset(&self) -> i64 {
        match self.file.as_deref() {
            Some(file) => {
                let mut file: &File = file;
                file.stream_position().map(|p| p as i64).unwrap_or(0)
            }
            None => 0,
        }
    }

    fn reserve(&mut self, size: i64) -> Result<()> {
        self.file = None;
        let rounded = round_up(size, self.block);
        self.set_attr("reset", "1")?;
        self.set_attr("disksize", &rounded.to_string())?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.dev_node)
            .map_err(|source| VeneerError::CannotOpen {
                what: self.dev_node.display().to_string(),
                source,
            })?;
        info!(
            target: "veneer::burn",
            device = %self.dev,
            disksize = rounded,
            "compressible-RAM scratch re-sized"
        );
        self.file = Some(Arc::new(file));
        Ok(())
    }

    fn append(&mut self, extent: &Extent) -> Result<i64> {
        let node = Arc::clone(self.node()?);
        let placement = self.offset();
        if extent.length() != 0 {
            extent.write_to(&node)?;
        }
        Ok(placement)
    }

    fn commit(&mut self) -> Result<()> {
        self.node()?.sync_all()?;
        Ok(())
    }

    fn as_medium(&self) -> Medium {
        match &self.file {
            Some(file) => Medium::direct_file(self.id, Arc::clone(file), self.dev, self.block),
            None => Medium::device(self.dev, self.block),
        }
    }
}

// ── Device-mapper burner ────────────────────────────────────────────────────

/// One row of a device-mapper table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTargetSpec {
    pub sector_start: i64,
    pub sector_count: i64,
    pub target: DmTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmTarget {
    /// `linear <major>:<minor> <sector_offset>`
    Linear { dev: DevNum, sector_offset: i64 },
    /// `zero` (no parameters)
    Zero,
}

impl DmTargetSpec {
    /// The textual parameter field as the kernel expects it.
    #[must_use]
    pub fn parameters(&self) -> String {
        match &self.target {
            DmTarget::Linear { dev, sector_offset } => format!("{dev} {sector_offset}"),
            DmTarget::Zero => String::new(),
        }
    }
}

/// Platform contract for the device-mapper control node. The concrete ioctl
/// binding lives outside this workspace; tests use a mock.
pub trait DmControl {
    fn create(&mut self, name: &str) -> Result<()>;
    fn remove(&mut self, name: &str) -> Result<()>;
    fn suspend(&mut self, name: &str) -> Result<()>;
    fn load_table(&mut self, name: &str, table: &[DmTargetSpec]) -> Result<()>;
    /// Resume the device, activating the loaded table; returns the device
    /// number the kernel assigned.
    fn resume(&mut self, name: &str) -> Result<DevNum>;
    fn list(&mut self) -> Result<Vec<(String, DevNum)>>;
}

/// A burner that builds a device-mapper linear table: mappable extents
/// become `linear` targets, everything else maps to `zero`. The kernel holds
/// the mapping after commit, so the virtual device outlives the process.
pub struct DmBurner {
    control: Box<dyn DmControl>,
    name: String,
    table: Vec<DmTargetSpec>,
    offset: i64,
    dev: Option<DevNum>,
}

impl DmBurner {
    /// Tears down any existing mapping under `name` and creates it afresh.
    pub fn create(name: &str, mut control: Box<dyn DmControl>) -> Result<Self> {
        if let Err(error) = control.suspend(name) {
            debug!(target: "veneer::burn", name, %error, "no existing mapping to suspend");
        }
        if let Err(error) = control.remove(name) {
            debug!(target: "veneer::burn", name, %error, "no existing mapping to remove");
        }
        control.create(name)?;
        Ok(Self {
            control,
            name: name.to_string(),
            table: Vec::new(),
            offset: 0,
            dev: None,
        })
    }

    #[must_use]
    pub fn device(&self) -> Option<DevNum> {
        self.dev
    }
}

impl Burner for DmBurner {
    fn block_size(&self) -> i64 {
        MAPPER_SECTOR
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn offset(&self) -> i64 {
        self.offset
    }

    fn append(&mut self, extent: &Extent) -> Result<i64> {
        let cur = self.offset;
        if extent.length() == 0 {
            return Ok(cur);
        }
        if extent.length() % MAPPER_SECTOR != 0 || extent.offset() % MAPPER_SECTOR != 0 {
            return Err(VeneerError::assertion(format!(
                "extent {} not sector-aligned for mapping",
                extent.range
            )));
        }
        let mappable = extent.medium.block_device().is_some() && extent.medium.is_direct_device();
        let target = if mappable {
            DmTarget::Linear {
                dev: extent.medium.block_device().unwrap_or(DevNum { major: 0, minor: 0 }),
                sector_offset: extent.offset() / MAPPER_SECTOR,
            }
        } else {
            DmTarget::Zero
        };
        self.table.push(DmTargetSpec {
            sector_start: cur / MAPPER_SECTOR,
            sector_count: extent.length() / MAPPER_SECTOR,
            target,
        });
        self.offset += extent.length();
        Ok(cur)
    }

    fn commit(&mut self) -> Result<()> {
        self.control.load_table(&self.name, &self.table)?;
        let dev = self.control.resume(&self.name)?;
        info!(
            target: "veneer::burn",
            name = %self.name,
            device = %dev,
            targets = self.table.len(),
            "mapping resumed"
        );
        self.dev = Some(dev);
        Ok(())
    }

    fn as_medium(&self) -> Medium {
        Medium::device(
            self.dev.unwrap_or(DevNum { major: 0, minor: 0 }),
            MAPPER_SECTOR,
        )
    }
}

// ── Planner ─────────────────────────────────────────────────────────────────

/// Collects extents and burns them in one transaction. Keeps the running
/// offset and the sticky client block size used for padding.
pub struct Planner {
    burner: Box<dyn Burner>,
    pending: Vec<Extent>,
    offset: i64,
    client_block: i64,
}

impl Planner {
    #[must_use]
    pub fn new(burner: Box<dyn Burner>) -> Self {
        Self {
            burner,
            pending: Vec::new(),
            offset: 0,
            client_block: 1,
        }
    }

    /// Block size maintained by this planner: the larger of the client
    /// request and the burner's native block.
    #[must_use]
    pub fn block_size(&self) -> i64 {
        self.client_block.max(self.burner.block_size())
    }

    /// Raise the minimum block size required by the client. Sticky: a
    /// 4k-clustered FAT on a 512-byte medium still needs 4k placement.
    pub fn request_block_size(&mut self, size: i64) {
        if self.client_block < size {
            self.client_block = size;
        }
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Append an extent to the pending list; returns its planned offset.
    pub fn append(&mut self, extent: Extent) -> Result<i64> {
        if extent.length() < 0 {
            return Err(VeneerError::assertion(format!(
                "extent length {:#x} < 0",
                extent.length()
            )));
        }
        let cur = self.offset;
        if extent.length() > 0 {
            self.offset += extent.length();
            self.pending.push(extent);
        }
        Ok(cur)
    }

    /// Pad to a block boundary with a zero extent; returns the pad size.
    pub fn pad_to(&mut self, block: i64) -> Result<i64> {
        let pad = padding(self.offset, block);
        self.append(Extent::zeroes(pad))?;
        Ok(pad)
    }

    /// Pad to the maintained block size.
    pub fn auto_pad(&mut self) -> Result<i64> {
        self.pad_to(self.block_size())
    }

    /// Seal the range since `since` and return it as a single extent of the
    /// backing burner, padded to the maintained block size. The idiom for
    /// re-exposing a metadata run packed on scratch as one extent of the
    /// final device.
    pub fn wrap_to_go(&mut self, since: i64) -> Result<Extent> {
        self.auto_pad()?;
        Ok(Extent::new(since, self.offset - since, self.burner.as_medium()))
    }

    /// The backing burner described as a medium.
    #[must_use]
    pub fn medium(&self) -> Medium {
        self.burner.as_medium()
    }

    /// Pad both planners to their common block size; returns that size.
    pub fn copad(left: &mut Planner, right: &mut Planner) -> Result<i64> {
        let block = left.block_size().max(right.block_size());
        left.pad_to(block)?;
        right.pad_to(block)?;
        Ok(block)
    }

    /// Burn the pending sequence: reserve, re-play every extent, verify the
    /// burner's own offset after each write, flush.
    pub fn commit(&mut self) -> Result<()> {
        self.burner.reserve(self.offset)?;
        let mut tracked = 0_i64;
        for extent in self.pending.drain(..) {
            self.burner.append(&extent)?;
            tracked += extent.length();
            let actual = self.burner.offset();
            if actual != tracked {
                return Err(VeneerError::assertion(format!(
                    "extent {} left burner at {actual:#x}, expected {tracked:#x}",
                    extent.range
                )));
            }
        }
        self.burner.commit()
    }
}

// ── Foster scratch ──────────────────────────────────────────────────────────

/// Adoption scratch: verbatim copies of unmappable source ranges, bounded
/// by a byte budget. Writes eagerly so the data is present before the
/// output planner replays extents that reference it.
pub struct FosterHouse {
    burner: Box<dyn Burner>,
    budget: i64,
}

impl FosterHouse {
    #[must_use]
    pub fn new(burner: Box<dyn Burner>, budget: i64) -> Self {
        Self { burner, budget }
    }
}

impl Adopt for FosterHouse {
    fn adopt(&mut self, source: &Extent) -> Option<Extent> {
        if self.burner.offset() + source.length() > self.budget {
            return None;
        }
        let at = match self.burner.append(source) {
            Ok(at) => at,
            Err(error) => {
                warn!(target: "veneer::burn", %error, "foster copy failed");
                return None;
            }
        };
        let block = self.burner.block_size();
        let pad = padding(self.burner.offset(), block);
        if pad > 0 {
            if let Err(error) = self.burner.append(&Extent::zeroes(pad)) {
                warn!(target: "veneer::burn", %error, "foster padding failed");
                return None;
            }
        }
        Some(Extent::new(
            at,
            self.burner.offset() - at,
            self.burner.as_medium(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_types::MediumId;

    fn bytes_extent(data: &[u8]) -> Extent {
        Extent::new(
            0,
            data.len() as i64,
            Medium::bytes(MediumId(0xb0b), data.to_vec()),
        )
    }

    #[test]
    fn vec_burner_concatenates_and_zero_fills() {
        let mut burner = VecBurner::new(4);
        burner.append(&bytes_extent(b"abc")).unwrap();
        burner.append(&Extent::zeroes(2)).unwrap();
        burner.append(&bytes_extent(b"z")).unwrap();
        assert_eq!(burner.contents(), b"abc\0\0z");
        assert_eq!(burner.offset(), 6);
    }

    #[test]
    fn planner_pads_and_wraps() {
        let mut planner = Planner::new(Box::new(VecBurner::new(1)));
        planner.request_block_size(8);
        planner.append(bytes_extent(b"hello")).unwrap();
        let wrapped = planner.wrap_to_go(0).unwrap();
        assert_eq!(wrapped.length(), 8);
        assert_eq!(planner.offset(), 8);
        // sticky client size survives later, smaller requests
        planner.request_block_size(4);
        assert_eq!(planner.block_size(), 8);
    }

    #[test]
    fn planner_rejects_negative_extents() {
        let mut planner = Planner::new(Box::new(VecBurner::new(1)));
        let bad = Extent::new(0, -1, Medium::zero());
        assert!(planner.append(bad).is_err());
    }

    #[test]
    fn planner_commit_replays_into_burner() {
        let mut planner = Planner::new(Box::new(VecBurner::new(1)));
        planner.append(bytes_extent(b"0123")).unwrap();
        planner.pad_to(8).unwrap();
        planner.append(bytes_extent(b"x")).unwrap();
        let medium = planner.medium();
        planner.commit().unwrap();
        let all = medium
            .read_range(veneer_types::Range::new(0, 9))
            .unwrap();
        assert_eq!(all, b"0123\0\0\0\0x");
    }

    #[test]
    fn file_burner_round_trip() {
        let tmp = tempfile::tempfile().unwrap();
        let mut burner = FileBurner::from_file(tmp, 1);
        burner.append(&bytes_extent(b"veneer")).unwrap();
        burner.append(&Extent::zeroes(2)).unwrap();
        burner.append(&bytes_extent(b"!")).unwrap();
        burner.commit().unwrap();
        let medium = burner.as_medium();
        let back = medium.read_range(veneer_types::Range::new(0, 9)).unwrap();
        assert_eq!(back, b"veneer\0\0!");
    }

    #[test]
    fn copad_aligns_both_planners() {
        let mut a = Planner::new(Box::new(VecBurner::new(4)));
        let mut b = Planner::new(Box::new(VecBurner::new(16)));
        a.append(bytes_extent(b"ab")).unwrap();
        b.append(bytes_extent(b"cdef0")).unwrap();
        let block = Planner::copad(&mut a, &mut b).unwrap();
        assert_eq!(block, 16);
        assert_eq!(a.offset() % 16, 0);
        assert_eq!(b.offset() % 16, 0);
    }

    struct RecordingControl;

    impl DmControl for RecordingControl {
        fn create(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }
        fn remove(&mut self, _name: &str) -> Result<()> {
            Err(VeneerError::assertion("no such device"))
        }
        fn suspend(&mut self, _name: &str) -> Result<()> {
            Err(VeneerError::assertion("no such device"))
        }
        fn load_table(&mut self, name: &str, table: &[DmTargetSpec]) -> Result<()> {
            assert_eq!(name, "virtualcd");
            assert_eq!(table.len(), 2);
            assert_eq!(
                table[0].target,
                DmTarget::Linear {
                    dev: DevNum { major: 8, minor: 1 },
                    sector_offset: 0x10000 / MAPPER_SECTOR,
                }
            );
            assert_eq!(table[0].sector_count, 0x2000 / MAPPER_SECTOR);
            assert_eq!(table[1].target, DmTarget::Zero);
            assert_eq!(table[1].sector_start, 0x2000 / MAPPER_SECTOR);
            Ok(())
        }
        fn resume(&mut self, _name: &str) -> Result<DevNum> {
            Ok(DevNum { major: 253, minor: 4 })
        }
        fn list(&mut self) -> Result<Vec<(String, DevNum)>> {
            Ok(vec![])
        }
    }

    #[test]
    fn dm_burner_builds_linear_and_zero_targets() {
        let mut burner = DmBurner::create("virtualcd", Box::new(RecordingControl)).unwrap();
        let disk = Medium::device(DevNum { major: 8, minor: 1 }, 4096);
        burner.append(&Extent::new(0x10000, 0x2000, disk)).unwrap();
        burner.append(&Extent::zeroes(0x1000)).unwrap();
        burner.commit().unwrap();
        assert_eq!(burner.device(), Some(DevNum { major: 253, minor: 4 }));
        assert_eq!(burner.offset(), 0x3000);
    }

    #[test]
    fn foster_house_respects_budget() {
        let mut foster = FosterHouse::new(Box::new(VecBurner::new(4)), 8);
        let adopted = foster.adopt(&bytes_extent(b"abcde")).expect("within budget");
        assert_eq!(adopted.offset(), 0);
        assert_eq!(adopted.length(), 8); // padded to the scratch block
        assert!(foster.adopt(&bytes_extent(b"toolong")).is_none());
    }
}
