#![forbid(unsafe_code)]
//! HFS Plus (HFSX) volume writer.
//!
//! Lays out a case-sensitive HFSX volume: MBR, volume header at 0x400 with
//! a backup copy near the end of the disk, file payload by extent
//! reference, then the catalog and extents-overflow B-trees, the
//! allocation bitmap, and the trailing run-off that rounds the volume to
//! its final block count. Catalog names are stored in Apple-canonical
//! decomposed form; CNIDs preserve source inode numbers wherever the
//! format allows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use veneer_burn::Planner;
use veneer_error::{Result, VeneerError};
use veneer_extent::{BitsFill, Extent, Medium, SharedBuf};
use veneer_geometry::Colonies;
use veneer_name::AppleDecompose;
use veneer_source::{EntryId, Original};
use veneer_types::wire::{put_u16_be, put_u32_be, put_u64_be, put_zeros};
use veneer_types::{round_up, MediumId, Timespec};
use veneer_volume::mbr::{Mbr, HFSPLUS_PARTITION_TYPE};
use veneer_volume::{adjust_block_size, Hybrid, Volume};

pub mod btree;

use btree::{HfsKey, TreeBuilder};

/// Seconds between 1904-01-01 and the Unix epoch.
const HFS_EPOCH_DELTA: i64 = 2_082_844_800;

/// Reserved catalog node ids.
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_FIRST_USER: u32 = 16;

const RECORD_FOLDER: i16 = 0x0001;
const RECORD_FILE: i16 = 0x0002;
const RECORD_FOLDER_THREAD: i16 = 0x0003;
const RECORD_FILE_THREAD: i16 = 0x0004;

const FLAG_THREAD_EXISTS: u16 = 1 << 1;
const FLAG_HAS_FOLDER_COUNT: u16 = 1 << 4;

const ATTR_VOLUME_UNMOUNTED: u32 = 1 << 8;
const ATTR_IDS_REUSED: u32 = 1 << 12;

const VOLUME_HEADER_LEN: usize = 512;
const VOLUME_HEADER_OFFSET: i64 = 0x400;
const INLINE_EXTENTS: usize = 8;

fn hfs_date(ts: Timespec) -> u32 {
    (ts.secs + HFS_EPOCH_DELTA).clamp(0, i64::from(u32::MAX)) as u32
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Catalog key: parent CNID plus the UTF-16 node name. HFSX binary compare
/// orders names by raw code unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CatalogKey {
    pub parent: u32,
    pub name: Vec<u16>,
}

impl CatalogKey {
    #[must_use]
    pub fn new(parent: u32, name: &str) -> Self {
        Self {
            parent,
            name: name.encode_utf16().collect(),
        }
    }

    #[must_use]
    pub fn thread(cnid: u32) -> Self {
        Self {
            parent: cnid,
            name: Vec::new(),
        }
    }
}

impl HfsKey for CatalogKey {
    fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 2 * self.name.len());
        put_u16_be(&mut out, (6 + 2 * self.name.len()) as u16);
        put_u32_be(&mut out, self.parent);
        put_u16_be(&mut out, self.name.len() as u16);
        for unit in &self.name {
            put_u16_be(&mut out, *unit);
        }
        out
    }
}

/// Extents-overflow key: file, fork, starting file block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExtentKey {
    pub file_id: u32,
    pub fork: u8,
    pub start_block: u32,
}

impl HfsKey for ExtentKey {
    fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        put_u16_be(&mut out, 10);
        out.push(self.fork);
        out.push(0);
        put_u32_be(&mut out, self.file_id);
        put_u32_be(&mut out, self.start_block);
        out
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Up to eight (start, count) allocation-block runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentRecord(pub [(u32, u32); INLINE_EXTENTS]);

impl ExtentRecord {
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        for (start, count) in self.0 {
            put_u32_be(&mut out, start);
            put_u32_be(&mut out, count);
        }
        out
    }
}

/// Fork location and size summary as stored in catalog records and the
/// volume header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

impl ForkData {
    /// Describe a fork stored as one contiguous target extent.
    #[must_use]
    pub fn from_extent(extent: &Extent, block: i64) -> Self {
        let total_blocks = (round_up(extent.length(), block) / block) as u32;
        let mut extents = ExtentRecord::default();
        extents.0[0] = ((extent.offset() / block) as u32, total_blocks);
        Self {
            logical_size: extent.length() as u64,
            clump_size: block as u32,
            total_blocks,
            extents,
        }
    }

    fn push_to(&self, out: &mut Vec<u8>) {
        put_u64_be(out, self.logical_size);
        put_u32_be(out, self.clump_size);
        put_u32_be(out, self.total_blocks);
        out.extend_from_slice(&self.extents.to_bytes());
    }
}

fn push_bsd_info(out: &mut Vec<u8>, is_dir: bool) {
    put_u32_be(out, 99); // owner: everyone
    put_u32_be(out, 99); // group: unknown
    out.push(0); // admin flags
    out.push(0); // owner flags
    let mode: u16 = if is_dir { 0o040_755 } else { 0o100_644 };
    put_u16_be(out, mode);
    put_u32_be(out, 0); // special
}

fn push_dates(out: &mut Vec<u8>, stat: &veneer_source::EntryStat) {
    put_u32_be(out, hfs_date(stat.ctime)); // create
    put_u32_be(out, hfs_date(stat.mtime)); // content mod
    put_u32_be(out, hfs_date(stat.ctime)); // attribute mod
    put_u32_be(out, hfs_date(stat.atime)); // access
    put_u32_be(out, 0); // backup: unknown
}

/// An 88-byte catalog folder record.
fn folder_record(
    cnid: u32,
    stat: &veneer_source::EntryStat,
    valence: u32,
    subfolders: u32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(88);
    put_u16_be(&mut out, RECORD_FOLDER as u16);
    put_u16_be(&mut out, FLAG_HAS_FOLDER_COUNT);
    put_u32_be(&mut out, valence);
    put_u32_be(&mut out, cnid);
    push_dates(&mut out, stat);
    push_bsd_info(&mut out, true);
    put_zeros(&mut out, 16); // folder Finder info
    put_zeros(&mut out, 16); // extended Finder info
    put_u32_be(&mut out, 0); // text encoding: MacRoman
    put_u32_be(&mut out, subfolders);
    debug_assert_eq!(out.len(), 88);
    out
}

/// A 248-byte catalog file record.
fn file_record(cnid: u32, stat: &veneer_source::EntryStat, data_fork: &ForkData) -> Vec<u8> {
    let mut out = Vec::with_capacity(248);
    put_u16_be(&mut out, RECORD_FILE as u16);
    put_u16_be(&mut out, FLAG_THREAD_EXISTS);
    put_u32_be(&mut out, 0); // valence is a folder notion
    put_u32_be(&mut out, cnid);
    push_dates(&mut out, stat);
    push_bsd_info(&mut out, false);
    put_zeros(&mut out, 16); // file Finder info
    put_zeros(&mut out, 16); // extended Finder info
    put_u32_be(&mut out, 0); // text encoding
    put_u32_be(&mut out, 0); // reserved
    data_fork.push_to(&mut out);
    ForkData::default().push_to(&mut out); // no resource forks
    debug_assert_eq!(out.len(), 248);
    out
}

/// A thread record pointing an object back at its parent.
fn thread_record(is_dir: bool, parent: u32, name: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + 2 * name.len());
    let kind = if is_dir {
        RECORD_FOLDER_THREAD
    } else {
        RECORD_FILE_THREAD
    };
    put_u16_be(&mut out, kind as u16);
    put_u16_be(&mut out, 0);
    put_u32_be(&mut out, parent);
    put_u16_be(&mut out, name.len() as u16);
    for unit in name {
        put_u16_be(&mut out, *unit);
    }
    out
}

// ── CNID assignment ─────────────────────────────────────────────────────────

/// Stable catalog-node-id assignment. Source inodes are kept so host-side
/// caches stay valid across rebuilds; the synthetic root is always CNID 2,
/// and inodes that collide with the reserved range or with each other are
/// displaced above the highest number in use.
pub fn assign_cnids(tree: &Original, jam_inodes: bool) -> HashMap<EntryId, u32> {
    let mut out = HashMap::new();
    let Some(root) = tree.root else {
        return out;
    };

    if jam_inodes {
        let mut next = CNID_FIRST_USER;
        for &dir in &tree.path_table {
            if dir == root {
                out.insert(dir, CNID_ROOT_FOLDER);
                continue;
            }
            out.insert(dir, next);
            next += 1;
        }
        for &file in &tree.file_table {
            out.insert(file, next);
            next += 1;
        }
        return out;
    }

    let mut highest = u64::from(CNID_FIRST_USER);
    for node in &tree.entries {
        highest = highest.max(node.stat.ino.min(u64::from(u32::MAX)));
    }
    let mut used: HashSet<u32> = HashSet::new();
    used.insert(CNID_ROOT_FOLDER);
    let mut next_free = (highest as u32).saturating_add(1);

    let ids: Vec<EntryId> = tree
        .path_table
        .iter()
        .chain(tree.file_table.iter())
        .copied()
        .collect();
    for id in ids {
        if id == root {
            out.insert(id, CNID_ROOT_FOLDER);
            continue;
        }
        let ino = tree.entry(id).stat.ino;
        let candidate = u32::try_from(ino).unwrap_or(0);
        let reserved = candidate < CNID_FIRST_USER;
        let assigned = if reserved || !used.insert(candidate) {
            let displaced = next_free;
            next_free = next_free.saturating_add(1);
            used.insert(displaced);
            displaced
        } else {
            candidate
        };
        out.insert(id, assigned);
    }
    out
}

// ── The writer ──────────────────────────────────────────────────────────────

/// HFSX volume writer; also serves as the hybrid slave of the CD writer,
/// co-describing the file area the master laid out.
pub struct HfsPlusOut {
    block: i64,
    label: String,
    jam_inodes: bool,
    deco: AppleDecompose,
    /// Header buffers planned during `master_reserved`, filled at
    /// completion.
    pending: Option<HeaderBufs>,
}

impl HfsPlusOut {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block: 0,
            label: String::new(),
            jam_inodes: false,
            deco: AppleDecompose::new(),
            pending: None,
        }
    }

    pub fn set_jam_inodes(&mut self, jam: bool) {
        self.jam_inodes = jam;
    }

    /// Catalog name of an entry: decomposed source name, or the volume
    /// label for the root (the name the Finder displays).
    fn catalog_name(&self, tree: &Original, id: EntryId) -> String {
        let node = tree.entry(id);
        if node.parent.is_none() || node.name.is_empty() {
            self.label.clone()
        } else {
            self.deco.correct(&node.name)
        }
    }

    /// MBR at 0, volume header at 0x400, wrapped out in one extent.
    fn plan_headers(
        &self,
        out: &mut Planner,
        tmp: &mut Planner,
        bufs: &mut HeaderBufs,
    ) -> Result<()> {
        let since = tmp.offset();
        tmp.append(Extent::new(
            0,
            512,
            Medium::shared(MediumId(0xb007), bufs.mbr.clone()),
        ))?;
        tmp.append(Extent::zeroes(VOLUME_HEADER_OFFSET - 512))?;
        tmp.append(Extent::new(
            0,
            VOLUME_HEADER_LEN as i64,
            Medium::shared(MediumId(0x4858), bufs.volume.clone()),
        ))?;
        let wrapped = tmp.wrap_to_go(since)?;
        out.append(wrapped)?;
        out.auto_pad()?;
        Ok(())
    }

    /// Catalog + overflow assembly, tree packing, allocation bitmap and the
    /// closing run-off. Shared between standalone planning and hybrid
    /// completion.
    fn plan_volume_body(
        &mut self,
        tree: &Original,
        out: &mut Planner,
        tmp: &mut Planner,
        colonies: &Colonies,
        bufs: &HeaderBufs,
    ) -> Result<()> {
        let block = self.block;
        let cnids = assign_cnids(tree, self.jam_inodes);

        let mut catalog: BTreeMap<CatalogKey, Vec<u8>> = BTreeMap::new();
        let mut overflow: BTreeMap<ExtentKey, ExtentRecord> = BTreeMap::new();

        let parent_cnid = |id: EntryId| -> u32 {
            match tree.entry(id).parent {
                Some(parent) => cnids[&parent],
                None => CNID_ROOT_PARENT,
            }
        };

        // folders, children before parents
        for &dir in tree.path_table.iter().rev() {
            let node = tree.entry(dir);
            let cnid = cnids[&dir];
            let name = self.catalog_name(tree, dir);
            let subfolders = node
                .children()
                .iter()
                .filter(|&&c| tree.entry(c).is_dir())
                .count() as u32;
            let record = folder_record(cnid, &node.stat, node.children().len() as u32, subfolders);
            catalog.insert(CatalogKey::new(parent_cnid(dir), &name), record);
            catalog.insert(
                CatalogKey::thread(cnid),
                thread_record(true, parent_cnid(dir), &CatalogKey::new(0, &name).name),
            );
        }

        // files: fork data with inline extents, spilling to overflow
        for &file in &tree.file_table {
            let node = tree.entry(file);
            let cnid = cnids[&file];
            let name = self.catalog_name(tree, file);

            let mut fork = ForkData {
                logical_size: node.stat.size as u64,
                clump_size: block as u32,
                ..ForkData::default()
            };
            // the record currently being filled: the inline one first, then
            // successive overflow records keyed by the starting file block
            let mut current = ExtentRecord::default();
            let mut current_key: Option<ExtentKey> = None;
            let mut slot = 0_usize;
            let mut file_block = 0_u32;
            let mut last: Option<(u32, u32)> = None;

            let empty = Vec::new();
            let extents = tree.layout.get(&file).unwrap_or(&empty);
            for extent in extents {
                let target = colonies.within_disk(extent);
                let lba = (target / block) as u32;
                let count = (round_up(extent.length(), block) / block) as u32;
                match last {
                    // target-contiguous runs merge into one descriptor
                    Some((start, len)) if start + len == lba => {
                        last = Some((start, len + count));
                        current.0[slot - 1] = (start, len + count);
                    }
                    _ => {
                        if slot == INLINE_EXTENTS {
                            match current_key {
                                Some(key) => {
                                    overflow.insert(key, current);
                                }
                                None => fork.extents = current,
                            }
                            current = ExtentRecord::default();
                            current_key = Some(ExtentKey {
                                file_id: cnid,
                                fork: 0,
                                start_block: file_block,
                            });
                            slot = 0;
                        }
                        current.0[slot] = (lba, count);
                        slot += 1;
                        last = Some((lba, count));
                    }
                }
                file_block += count;
            }
            match current_key {
                Some(key) => {
                    overflow.insert(key, current);
                }
                None => fork.extents = current,
            }
            fork.total_blocks = file_block;

            let record = file_record(cnid, &node.stat, &fork);
            catalog.insert(CatalogKey::new(parent_cnid(file), &name), record);
            catalog.insert(
                CatalogKey::thread(cnid),
                thread_record(false, parent_cnid(file), &CatalogKey::new(0, &name).name),
            );
        }

        // pack both trees and burn them through the scratch
        let mut catalog_tree = TreeBuilder::for_catalog(6 + 2 * 255);
        catalog_tree.set_clump_size(block as u32);
        let catalog_data: Vec<(CatalogKey, Vec<u8>)> = catalog.into_iter().collect();
        catalog_tree.compact(&catalog_data)?;

        let mut extent_tree = TreeBuilder::for_overflow(10);
        extent_tree.set_clump_size(block as u32);
        let overflow_data: Vec<(ExtentKey, Vec<u8>)> = overflow
            .into_iter()
            .map(|(key, record)| (key, record.to_bytes()))
            .collect();
        extent_tree.compact(&overflow_data)?;

        info!(
            target: "veneer::hfsplus",
            catalog_records = catalog_data.len(),
            overflow_records = overflow_data.len(),
            catalog_nodes = catalog_tree.node_count(),
            "trees packed"
        );

        let catalog_fork = self.burn_tree(&mut catalog_tree, out, tmp)?;
        let extents_fork = self.burn_tree(&mut extent_tree, out, tmp)?;

        // allocation bitmap, bit count finalized after the run-off below
        let mut claimed = (out.offset() << 3) / ((block << 3) - 1) + 2;
        let bits = Arc::new(BitsFill::new(1 << 16, claimed));
        let alloc_len = round_up(bits.byte_count(), block);
        let alloc_at = tmp.append(Extent::new(
            0,
            alloc_len,
            Medium::rule(MediumId(0xa110c), Arc::clone(&bits) as Arc<dyn veneer_extent::FillRule>),
        ))?;
        let tmp_alloc = tmp.wrap_to_go(alloc_at)?;
        let out_at = out.append(tmp_alloc)?;
        let out_alloc = out.wrap_to_go(out_at)?;
        let alloc_fork = ForkData::from_extent(&out_alloc, block);
        debug!(
            target: "veneer::hfsplus",
            offset = out_alloc.offset(),
            length = out_alloc.length(),
            "allocation bitmap placed"
        );

        // run-off: round the volume to its final block count and mirror the
        // volume header near the end of the disk
        let coblock = Planner::copad(out, tmp)?;
        let current = out.offset();
        let current_blocks = current / block;
        if current_blocks <= claimed {
            claimed = current_blocks + (coblock / block).max(1);
        }
        bits.reserve_bits(claimed);
        let total_bytes = claimed * block;
        let prepend = total_bytes - current - VOLUME_HEADER_OFFSET;
        let tail_start = tmp.append(Extent::zeroes(prepend))?;
        tmp.append(Extent::new(
            0,
            VOLUME_HEADER_LEN as i64,
            Medium::shared(MediumId(0x4858), bufs.volume.clone()),
        ))?;
        tmp.append(Extent::zeroes(VOLUME_HEADER_OFFSET - VOLUME_HEADER_LEN as i64))?;
        out.append(tmp.wrap_to_go(tail_start)?)?;

        // every location is final: fill the deferred headers
        let root_stat = tree.root.map(|root| tree.entry(root).stat);
        let highest = cnids.values().copied().max().unwrap_or(CNID_FIRST_USER);
        let header = VolumeHeader {
            block_size: block as u32,
            total_blocks: claimed as u32,
            file_count: tree.file_table.len() as u32,
            folder_count: tree.path_table.len().saturating_sub(1) as u32,
            next_catalog_id: highest.saturating_add(1),
            create_date: root_stat.map(|s| hfs_date(s.ctime)).unwrap_or(0),
            modify_date: root_stat.map(|s| hfs_date(s.mtime)).unwrap_or(0),
            allocation: alloc_fork,
            extents: extents_fork,
            catalog: catalog_fork,
        };
        bufs.volume.fill(&header.to_bytes());
        bufs.mbr
            .fill(&Mbr::spanning(HFSPLUS_PARTITION_TYPE, total_bytes).to_bytes());
        Ok(())
    }

    /// Write a packed tree through the scratch and re-expose it as one
    /// output extent.
    fn burn_tree(
        &self,
        builder: &mut TreeBuilder,
        out: &mut Planner,
        tmp: &mut Planner,
    ) -> Result<ForkData> {
        let image = builder.serialize()?;
        let at = tmp.append(Extent::new(
            0,
            image.len() as i64,
            Medium::bytes(MediumId(0xb7ee), image),
        ))?;
        let tmp_extent = tmp.wrap_to_go(at)?;
        let out_at = out.append(tmp_extent)?;
        let out_extent = out.wrap_to_go(out_at)?;
        Ok(ForkData::from_extent(&out_extent, self.block))
    }
}

impl Default for HfsPlusOut {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred header buffers: both are referenced by early extents and filled
/// once the final geometry is known.
struct HeaderBufs {
    mbr: SharedBuf,
    volume: SharedBuf,
}

impl HeaderBufs {
    fn new() -> Self {
        Self {
            mbr: SharedBuf::new(512),
            volume: SharedBuf::new(VOLUME_HEADER_LEN),
        }
    }
}

struct VolumeHeader {
    block_size: u32,
    total_blocks: u32,
    file_count: u32,
    folder_count: u32,
    next_catalog_id: u32,
    create_date: u32,
    modify_date: u32,
    allocation: ForkData,
    extents: ForkData,
    catalog: ForkData,
}

impl VolumeHeader {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VOLUME_HEADER_LEN);
        out.extend_from_slice(b"HX"); // HFSX signature
        put_u16_be(&mut out, 5); // version
        put_u32_be(&mut out, ATTR_VOLUME_UNMOUNTED | ATTR_IDS_REUSED);
        out.extend_from_slice(b"10.0"); // last mounted version
        put_u32_be(&mut out, 0); // journal info block: no journal
        put_u32_be(&mut out, self.create_date);
        put_u32_be(&mut out, self.modify_date);
        put_u32_be(&mut out, 0); // backup date
        put_u32_be(&mut out, 0); // checked date
        put_u32_be(&mut out, self.file_count);
        put_u32_be(&mut out, self.folder_count);
        put_u32_be(&mut out, self.block_size);
        put_u32_be(&mut out, self.total_blocks);
        put_u32_be(&mut out, 0); // free blocks
        put_u32_be(&mut out, 0); // next allocation
        put_u32_be(&mut out, self.block_size); // resource clump
        put_u32_be(&mut out, self.block_size); // data clump
        put_u32_be(&mut out, self.next_catalog_id);
        put_u32_be(&mut out, self.modify_date); // write count stand-in
        put_u64_be(&mut out, 1); // encodings bitmap: MacRoman
        put_zeros(&mut out, 32); // Finder info
        self.allocation.push_to(&mut out);
        self.extents.push_to(&mut out);
        self.catalog.push_to(&mut out);
        ForkData::default().push_to(&mut out); // attributes: reserved
        ForkData::default().push_to(&mut out); // startup: reserved
        debug_assert_eq!(out.len(), VOLUME_HEADER_LEN);
        out
    }
}

impl Volume for HfsPlusOut {
    fn size_range(&self) -> i64 {
        // whole B-tree nodes per block: 4k, or 8k to hold a catalog node
        0x3000
    }

    fn block_size(&self) -> i64 {
        self.block
    }

    fn set_block_size(&mut self, block: i64) {
        self.block = block;
    }

    fn set_labels(&mut self, _system: &str, volume: &str) {
        self.label = volume.to_string();
    }

    fn plan(&mut self, tree: &Original, out: &mut Planner, tmp: &mut Planner) -> Result<Colonies> {
        let mut bufs = HeaderBufs::new();
        self.plan_headers(out, tmp, &mut bufs)?;
        let colonies = tree.geometry.write_files(out)?;
        self.plan_volume_body(tree, out, tmp, &colonies, &bufs)?;
        Ok(colonies)
    }
}

impl Hybrid for HfsPlusOut {
    fn master_adjusted(
        &mut self,
        tree: &Original,
        out_block: i64,
        tmp_block: i64,
        _master_block: i64,
    ) -> Result<()> {
        // the master's block size is its own business
        adjust_block_size(self, tree, out_block, tmp_block, 0)
    }

    fn master_reserved(
        &mut self,
        _tree: &Original,
        out: &mut Planner,
        tmp: &mut Planner,
        _cap: i64,
    ) -> Result<()> {
        if out.offset() != 0 {
            return Err(VeneerError::assertion(format!(
                "hybrid slave must open the disk, master already at {:#x}",
                out.offset()
            )));
        }
        let mut bufs = HeaderBufs::new();
        self.plan_headers(out, tmp, &mut bufs)?;
        self.pending = Some(bufs);
        Ok(())
    }

    fn master_complete(
        &mut self,
        tree: &Original,
        out: &mut Planner,
        tmp: &mut Planner,
        colonies: &Colonies,
    ) -> Result<()> {
        let bufs = self
            .pending
            .take()
            .ok_or_else(|| VeneerError::assertion("hybrid completion without reserved headers"))?;
        self.plan_volume_body(tree, out, tmp, colonies, &bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veneer_extent::NoLocator;

    #[test]
    fn catalog_key_ordering_is_parent_then_binary_name() {
        let a = CatalogKey::new(2, "Abc");
        let b = CatalogKey::new(2, "abc");
        let c = CatalogKey::new(3, "AAA");
        assert!(a < b, "uppercase code units sort first under binary compare");
        assert!(b < c, "parent id dominates");
        assert!(CatalogKey::thread(2) < a, "empty names sort first");
    }

    #[test]
    fn catalog_key_bytes_layout() {
        let key = CatalogKey::new(2, "AB");
        let bytes = key.key_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..2], &10_u16.to_be_bytes()); // 6 + 2*2
        assert_eq!(&bytes[2..6], &2_u32.to_be_bytes());
        assert_eq!(&bytes[6..8], &2_u16.to_be_bytes());
        assert_eq!(&bytes[8..10], &(b'A' as u16).to_be_bytes());
    }

    #[test]
    fn volume_header_is_512_bytes_signed_hx() {
        let header = VolumeHeader {
            block_size: 4096,
            total_blocks: 100,
            file_count: 3,
            folder_count: 1,
            next_catalog_id: 20,
            create_date: 1,
            modify_date: 2,
            allocation: ForkData::default(),
            extents: ForkData::default(),
            catalog: ForkData::default(),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..2], b"HX");
        assert_eq!(&bytes[2..4], &5_u16.to_be_bytes());
        // attributes: proper masks, not bit numbers
        assert_eq!(
            u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            (1 << 8) | (1 << 12)
        );
    }

    #[test]
    fn cnid_root_is_two_and_reserved_inos_are_displaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"y").unwrap();
        let mut tree = Original::new(Box::new(NoLocator));
        tree.open_root(dir.path()).unwrap();

        let cnids = assign_cnids(&tree, false);
        assert_eq!(cnids[&tree.root.unwrap()], CNID_ROOT_FOLDER);
        let mut seen = HashSet::new();
        for (&id, &cnid) in &cnids {
            if id != tree.root.unwrap() {
                assert!(cnid >= CNID_FIRST_USER, "reserved CNID leaked: {cnid}");
            }
            assert!(seen.insert(cnid), "duplicate CNID {cnid}");
        }

        let jammed = assign_cnids(&tree, true);
        let mut values: Vec<u32> = jammed
            .iter()
            .filter(|(&id, _)| id != tree.root.unwrap())
            .map(|(_, &v)| v)
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![16, 17]);
    }

    #[test]
    fn thread_records_follow_their_entries() {
        // catalog thread law on a synthetic catalog
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/Café.txt"), b"data").unwrap();
        let mut tree = Original::new(Box::new(NoLocator));
        tree.open_root(dir.path()).unwrap();

        let mut writer = HfsPlusOut::new();
        writer.set_block_size(4096);
        writer.set_labels("", "TESTVOL");

        let cnids = assign_cnids(&tree, false);
        let mut catalog: BTreeMap<CatalogKey, Vec<u8>> = BTreeMap::new();
        for &id in tree.path_table.iter().chain(tree.file_table.iter()) {
            let node = tree.entry(id);
            let cnid = cnids[&id];
            let parent = node.parent.map(|p| cnids[&p]).unwrap_or(CNID_ROOT_PARENT);
            let name = writer.catalog_name(&tree, id);
            let record = if node.is_dir() {
                folder_record(cnid, &node.stat, node.children().len() as u32, 0)
            } else {
                file_record(cnid, &node.stat, &ForkData::default())
            };
            catalog.insert(CatalogKey::new(parent, &name), record);
            catalog.insert(
                CatalogKey::thread(cnid),
                thread_record(node.is_dir(), parent, &CatalogKey::new(0, &name).name),
            );
        }

        for (key, record) in &catalog {
            if key.name.is_empty() {
                continue;
            }
            let kind = i16::from_be_bytes(record[0..2].try_into().unwrap());
            assert!(kind == RECORD_FOLDER || kind == RECORD_FILE);
            let cnid = u32::from_be_bytes(record[8..12].try_into().unwrap());
            let thread = catalog
                .get(&CatalogKey::thread(cnid))
                .expect("thread record exists");
            let thread_parent = u32::from_be_bytes(thread[4..8].try_into().unwrap());
            assert_eq!(thread_parent, key.parent);
            let name_len = u16::from_be_bytes(thread[8..10].try_into().unwrap()) as usize;
            let mut name = Vec::with_capacity(name_len);
            for unit in 0..name_len {
                let at = 10 + 2 * unit;
                name.push(u16::from_be_bytes(thread[at..at + 2].try_into().unwrap()));
            }
            assert_eq!(name, key.name, "thread name mirrors the catalog key");
        }

        // precomposed source names land decomposed (scenario: Café.txt)
        let decomposed: Vec<u16> = "Cafe\u{301}.txt".encode_utf16().collect();
        assert!(catalog.keys().any(|k| k.name == decomposed));
    }
}
