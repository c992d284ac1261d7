#![forbid(unsafe_code)]
//! FAT32 volume writer.
//!
//! Reserved sectors, N mapped copies of a rule-generated FAT, the file
//! payload by extent reference, then directories leaves-first. The FAT is
//! never materialized as a table in memory: the default generator yields
//! `index + 1` at every position (or zeroes for mostly-free scratch
//! volumes) and the chain ends, cross-extent links and media flags are
//! sparse amendments applied over it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veneer_burn::Planner;
use veneer_error::{Result, VeneerError};
use veneer_extent::{Amendment, Extent, FillRule, Medium, SharedBuf};
use veneer_geometry::Colonies;
use veneer_name::{label_crc32, pack_ansi, pack_ucs2_le, NameRule};
use veneer_source::{EntryId, Original};
use veneer_types::wire::{put_u16_le, put_u32_le, put_zeros};
use veneer_types::{first_block, last_block, round_up, MediumId, Timespec, MAPPER_SECTOR};
use veneer_volume::Volume;

/// End-of-chain marker; also the value parked in `fat[1]`.
pub const END_OF_CHAIN: u32 = 0x0fff_ffff;
/// `fat[0]`: media descriptor with high bits set.
pub const MEDIA_MARK: u32 = 0x0fff_fff8;
/// The first usable cluster; 0 and 1 are the media mark and the end-of-chain
/// prototype.
pub const SEED_CLUSTERS: i64 = 2;
/// Below 65525 clusters a driver may legally decide the volume is FAT16; we
/// stay clear of the boundary.
pub const MIN_FAT32_CLUSTERS: i64 = 65537;

const CLUSTER_LINK_SIZE: i64 = 4;
const MAX_FILL_CHUNK: i64 = 1 << 18;
const FILL_LANE: i64 = 16;
const DIR_ENTRY_SIZE: usize = 32;
const LFN_CHARS_PER_ENTRY: usize = 13;

const ATTR_LABEL: u8 = 1 << 3;
const ATTR_FOLDER: u8 = 1 << 4;
const ATTR_LONG_NAME: u8 = 0x0f;

// ── FAT rule medium ─────────────────────────────────────────────────────────

/// The FAT as generated content plus sparse amendments.
pub struct FatFill {
    favor_freespace: bool,
    total_length: Mutex<i64>,
    amendments: Mutex<BTreeMap<i64, Amendment>>,
}

impl FatFill {
    #[must_use]
    pub fn new(favor_freespace: bool) -> Self {
        Self {
            favor_freespace,
            total_length: Mutex::new(0),
            amendments: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn reserve(&self, cluster_count: i64) {
        *self.total_length.lock() = cluster_count * CLUSTER_LINK_SIZE;
    }

    fn amend(&self, offset: i64, value: u32) {
        self.amendments
            .lock()
            .insert(offset, Amendment::U32Le(value));
    }

    /// `fat[0]` and `fat[1]`: media descriptor and end-of-chain prototype.
    pub fn set_media_flags(&self) {
        let mut bytes = Vec::with_capacity(8);
        put_u32_le(&mut bytes, MEDIA_MARK);
        put_u32_le(&mut bytes, END_OF_CHAIN);
        self.amendments.lock().insert(0, Amendment::Bytes(bytes));
    }

    /// A straight run of increasing links covering `[first, last]`.
    pub fn set_line(&self, first: i64, last: i64) {
        if self.favor_freespace {
            // free space is the default here, so every used cluster needs
            // its link written out
            for blk in first..last {
                self.amend(blk * CLUSTER_LINK_SIZE, (blk + 1) as u32);
            }
        } else {
            self.shadow(first);
        }
    }

    /// Terminate the default chain that would otherwise run into `first`.
    pub fn shadow(&self, first: i64) {
        if first <= SEED_CLUSTERS {
            return;
        }
        let offset = (first - 1) * CLUSTER_LINK_SIZE;
        let mut amendments = self.amendments.lock();
        amendments
            .entry(offset)
            .or_insert(Amendment::U32Le(END_OF_CHAIN));
    }

    /// Cross-extent link: the last cluster of one run points at the first
    /// of the next.
    pub fn set_next(&self, last_prev: i64, first_next: i64) -> Result<()> {
        let offset = last_prev * CLUSTER_LINK_SIZE;
        if offset >= *self.total_length.lock() {
            return Err(VeneerError::assertion(format!(
                "FAT underflow: amendment {offset:#x} outside reserved table"
            )));
        }
        self.amend(offset, first_next as u32);
        Ok(())
    }

    pub fn set_last(&self, last: i64) -> Result<()> {
        self.set_next(last, i64::from(END_OF_CHAIN))
    }
}

impl FillRule for FatFill {
    fn chunk_size(&self) -> usize {
        let total = *self.total_length.lock();
        round_up(total, FILL_LANE).clamp(FILL_LANE, MAX_FILL_CHUNK) as usize
    }

    fn fill(&self, chunk: &mut [u8], offset: i64) {
        if self.favor_freespace {
            chunk.fill(0);
            return;
        }
        // 01 00 00 00 02 00 00 00 ... — a lane-striped pattern the
        // optimizer turns into wide stores
        let mut value = (offset / CLUSTER_LINK_SIZE) as u32;
        for lane in chunk.chunks_exact_mut(CLUSTER_LINK_SIZE as usize) {
            value = value.wrapping_add(1);
            lane.copy_from_slice(&value.to_le_bytes());
        }
    }

    fn amendments(&self) -> Vec<(i64, Amendment)> {
        self.amendments
            .lock()
            .iter()
            .map(|(&k, v)| (k, v.clone()))
            .collect()
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

fn fat_date(ts: Timespec) -> u16 {
    let c = ts.civil();
    let year = (c.year - 1980).clamp(0, 127) as u16;
    ((year) << 9) | ((c.month as u16) << 5) | c.day as u16
}

fn fat_time(ts: Timespec) -> u16 {
    let c = ts.civil();
    ((c.hour as u16) << 11) | ((c.minute as u16) << 5) | (c.second as u16 >> 1)
}

// ── Directory entries ───────────────────────────────────────────────────────

/// An 8.3 short entry. `name` and `ext` are already padded.
struct ShortEntry {
    name: [u8; 8],
    ext: [u8; 3],
    attrs: u8,
    start_cluster: i64,
    size: u32,
    stat: Option<veneer_source::EntryStat>,
}

impl ShortEntry {
    fn blank() -> Self {
        Self {
            name: [b' '; 8],
            ext: [b' '; 3],
            attrs: 0,
            start_cluster: 0,
            size: 0,
            stat: None,
        }
    }

    fn checksum(&self) -> u8 {
        let mut crc = 0_u8;
        for byte in self.name.iter().chain(self.ext.iter()) {
            crc = ((crc & 1) << 7).wrapping_add(crc >> 1).wrapping_add(*byte);
        }
        crc
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DIR_ENTRY_SIZE);
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.ext);
        out.push(self.attrs);
        out.push(0); // case hints
        match &self.stat {
            Some(stat) => {
                out.push((stat.ctime.centis() + 100 * (stat.ctime.secs as u32 & 1)) as u8);
                put_u16_le(&mut out, fat_time(stat.ctime));
                put_u16_le(&mut out, fat_date(stat.ctime));
                put_u16_le(&mut out, fat_date(stat.atime));
                put_u16_le(&mut out, ((self.start_cluster >> 16) & 0xfff) as u16);
                put_u16_le(&mut out, fat_time(stat.mtime));
                put_u16_le(&mut out, fat_date(stat.mtime));
            }
            None => {
                put_zeros(&mut out, 7);
                put_u16_le(&mut out, ((self.start_cluster >> 16) & 0xfff) as u16);
                put_zeros(&mut out, 4);
            }
        }
        put_u16_le(&mut out, (self.start_cluster & 0xffff) as u16);
        put_u32_le(&mut out, self.size);
        debug_assert_eq!(out.len(), DIR_ENTRY_SIZE);
        out
    }
}

/// UCS-2-LE name bytes cut into 26-byte slices: NUL-terminated, 0xFF-filled.
fn scatter_long_name(name: &str) -> Vec<u8> {
    let chars: Vec<char> = name.chars().collect();
    let mut bytes = pack_ucs2_le(&chars);
    let slice = 2 * LFN_CHARS_PER_ENTRY;
    let remainder = bytes.len() % slice;
    if remainder != 0 {
        if remainder + 2 <= slice {
            bytes.extend_from_slice(&[0, 0]);
        }
        while bytes.len() % slice != 0 {
            bytes.push(0xff);
        }
    }
    bytes
}

/// The long-name chain preceding a synthetic short entry, last slice first.
fn long_name_entries(name: &str, checksum: u8) -> Vec<Vec<u8>> {
    let scattered = scatter_long_name(name);
    let slice = 2 * LFN_CHARS_PER_ENTRY;
    let count = scattered.len() / slice;
    let mut out = Vec::with_capacity(count);
    for seq in (1..=count).rev() {
        let chunk = &scattered[(seq - 1) * slice..seq * slice];
        let mut entry = Vec::with_capacity(DIR_ENTRY_SIZE);
        let mut seq_byte = seq as u8;
        if seq == count {
            seq_byte |= 0x40; // physically first, logically last
        }
        entry.push(seq_byte);
        entry.extend_from_slice(&chunk[0..10]);
        entry.push(ATTR_LONG_NAME);
        entry.push(0); // VFAT type
        entry.push(checksum);
        entry.extend_from_slice(&chunk[10..22]);
        put_zeros(&mut entry, 2); // no cluster
        entry.extend_from_slice(&chunk[22..26]);
        debug_assert_eq!(entry.len(), DIR_ENTRY_SIZE);
        out.push(entry);
    }
    out
}

// ── Prepared directories ────────────────────────────────────────────────────

struct PreparedChild {
    child: EntryId,
    /// `Some` when the canonical 8.3 form round-trips the source name.
    short: Option<(Vec<u8>, Option<Vec<u8>>)>,
}

struct PreparedDir {
    id: EntryId,
    offset_in_fat: i64,
    byte_size: i64,
    children: Vec<PreparedChild>,
}

// ── The writer ──────────────────────────────────────────────────────────────

pub struct VFat32Out {
    block: i64,
    fat_count: u8,
    oem_name: String,
    volume_label: String,
    scratch: bool,
    extra_room: i64,
    /// FSInfo free/next hints produced for scratch volumes.
    free_hints: Option<(u32, u32)>,
}

impl VFat32Out {
    #[must_use]
    pub fn new() -> Self {
        Self {
            block: 0,
            fat_count: 2, // two copies keep quirky legacy drivers content
            oem_name: "MSDOS5.0".to_string(),
            volume_label: String::new(),
            scratch: false,
            extra_room: 0,
            free_hints: None,
        }
    }

    #[must_use]
    pub fn fat_count(&self) -> u8 {
        self.fat_count
    }

    /// FSInfo free/next-free cluster hints of the last planned volume.
    #[must_use]
    pub fn free_hints(&self) -> Option<(u32, u32)> {
        self.free_hints
    }

    pub fn set_fat_count(&mut self, count: u8) {
        self.fat_count = count.max(1);
    }

    /// Cluster estimate: payload, directory entries, one cluster per
    /// directory, requested extra room; floored so the volume is
    /// unambiguously FAT32.
    fn cluster_count(&self, tree: &Original) -> i64 {
        let block = self.block;
        let mut footprint = tree.geometry.total_length();
        let entry_count = tree.file_table.len() + tree.path_table.len() * 4;
        footprint += (entry_count * DIR_ENTRY_SIZE) as i64;
        footprint += block * tree.path_table.len() as i64;
        footprint += round_up(self.extra_room, block);
        footprint = round_up(footprint, block);
        debug!(
            target: "veneer::fat32",
            footprint,
            cluster = block,
            "cluster estimate"
        );
        (footprint / block + SEED_CLUSTERS).max(MIN_FAT32_CLUSTERS)
    }

    /// Boot sector, FS information sector and the two signature-only
    /// backups. Returns the reserved sector count.
    fn plan_headers(
        &self,
        tmp: &mut Planner,
        boot: &SharedBuf,
        info: &SharedBuf,
    ) -> Result<i64> {
        tmp.append(Extent::new(0, 512, Medium::shared(MediumId(0xb00), boot.clone())))?;
        tmp.pad_to(MAPPER_SECTOR)?;
        tmp.append(Extent::new(0, 512, Medium::shared(MediumId(0xf51), info.clone())))?;
        for _ in 0..2 {
            tmp.append(Extent::zeroes(0x1fc))?;
            tmp.append(Extent::new(
                0,
                4,
                Medium::bytes(MediumId(0x55aa), vec![0, 0, 0x55, 0xaa]),
            ))?;
            tmp.pad_to(self.block)?;
        }
        Ok(tmp.offset() / MAPPER_SECTOR)
    }

    /// Canonicalize one child name: `Some((name, ext))` when the 8.3 form
    /// round-trips and no long-name chain is needed.
    fn short_name(&self, source: &str, is_file: bool) -> Option<([u8; 8], [u8; 3])> {
        let rule = NameRule::fat_volume();
        let fitted = rule.apply(source, is_file);
        if fitted.text() != source {
            return None;
        }
        let mut name = [b' '; 8];
        let mut ext = [b' '; 3];
        let base_end = fitted.sep(0);
        let base = pack_ansi(&fitted.conv[..base_end.min(8)]);
        name[..base.len()].copy_from_slice(&base);
        if fitted.seps.first().is_some() {
            let tail = &fitted.conv[(base_end + 1).min(fitted.conv.len())..];
            let packed = pack_ansi(&tail[..tail.len().min(3)]);
            ext[..packed.len()].copy_from_slice(&packed);
        }
        Some((name, ext))
    }

    fn prepare_directories(&self, tree: &Original, first_offset: i64) -> Vec<PreparedDir> {
        let mut dirs = Vec::new();
        let mut pos = first_offset;
        for &dir_id in tree.path_table.iter().rev() {
            let node = tree.entry(dir_id);
            let lead = if node.parent.is_some() { 2 } else { 1 };
            let mut slots = lead; // dot pair, or the volume label
            let mut children = Vec::new();
            for &child in node.children() {
                let child_node = tree.entry(child);
                let short = self
                    .short_name(&child_node.name, child_node.is_file())
                    .map(|(name, ext)| (name.to_vec(), Some(ext.to_vec())));
                let used = match &short {
                    Some(_) => 1,
                    None => {
                        1 + scatter_long_name(&child_node.name).len() / (2 * LFN_CHARS_PER_ENTRY)
                    }
                };
                slots += used;
                children.push(PreparedChild { child, short });
            }
            slots += 1; // terminating blank entry
            let byte_size = (slots * DIR_ENTRY_SIZE) as i64;
            dirs.push(PreparedDir {
                id: dir_id,
                offset_in_fat: pos,
                byte_size,
                children,
            });
            pos += round_up(byte_size, self.block);
        }
        dirs
    }

    fn emit_directory(
        &self,
        tree: &Original,
        colonies: &Colonies,
        fat: &FatFill,
        placed: &HashMap<EntryId, i64>,
        dir: &PreparedDir,
    ) -> Result<Vec<u8>> {
        let block = self.block;
        let node = tree.entry(dir.id);
        let own_cluster = first_block(dir.offset_in_fat, block);
        let mut out = Vec::with_capacity(dir.byte_size as usize);

        if let Some(parent) = node.parent {
            let mut dot = ShortEntry::blank();
            dot.name[0] = b'.';
            dot.attrs = ATTR_FOLDER;
            dot.start_cluster = own_cluster;
            dot.stat = Some(node.stat);
            out.extend_from_slice(&dot.to_bytes());

            let mut dotdot = ShortEntry::blank();
            dotdot.name[0] = b'.';
            dotdot.name[1] = b'.';
            dotdot.attrs = ATTR_FOLDER;
            dotdot.start_cluster = first_block(placed[&parent], block);
            dotdot.stat = Some(tree.entry(parent).stat);
            out.extend_from_slice(&dotdot.to_bytes());
        } else {
            let mut label = ShortEntry::blank();
            let packed = pack_ansi(&self.volume_label.chars().collect::<Vec<_>>());
            let take = packed.len().min(11);
            let mut both = [b' '; 11];
            both[..take].copy_from_slice(&packed[..take]);
            label.name.copy_from_slice(&both[..8]);
            label.ext.copy_from_slice(&both[8..]);
            label.attrs = ATTR_LABEL;
            out.extend_from_slice(&label.to_bytes());
        }

        for prepared in &dir.children {
            let child = tree.entry(prepared.child);
            let mut entry = ShortEntry::blank();
            entry.stat = Some(child.stat);
            if child.is_dir() {
                entry.attrs = ATTR_FOLDER;
                entry.start_cluster = first_block(placed[&prepared.child], block);
            } else {
                entry.size = child.stat.size as u32;
                if let Some(first) = tree.layout.get(&prepared.child).and_then(|l| l.first()) {
                    entry.start_cluster = first_block(colonies.within_area(first), block);
                }
                // empty files keep starting cluster 0
            }

            match &prepared.short {
                Some((name, ext)) => {
                    entry.name.copy_from_slice(&name[..8]);
                    if let Some(ext) = ext {
                        entry.ext.copy_from_slice(&ext[..3]);
                    }
                    out.extend_from_slice(&entry.to_bytes());
                }
                None => {
                    // synthetic short name: a leading space forces readers
                    // onto the long-name chain; the tail disambiguates by
                    // directory position
                    let mut numb = out.len() as i64;
                    entry.name[0] = b' ';
                    entry.name[1] = 0;
                    for byte in entry.name.iter_mut().skip(2) {
                        *byte = (numb % 23) as u8;
                        numb /= 7;
                    }
                    for lfn in long_name_entries(&child.name, entry.checksum()) {
                        out.extend_from_slice(&lfn);
                    }
                    out.extend_from_slice(&entry.to_bytes());
                }
            }
        }
        put_zeros(&mut out, DIR_ENTRY_SIZE);

        if out.len() as i64 != dir.byte_size {
            return Err(VeneerError::assertion(format!(
                "directory measured {:#x} but emitted {:#x} bytes",
                dir.byte_size,
                out.len()
            )));
        }
        out.resize(round_up(dir.byte_size, block) as usize, 0);

        let own_extent_end = dir.offset_in_fat + out.len() as i64;
        fat.set_line(own_cluster, last_block(own_extent_end, block));
        fat.set_last(last_block(own_extent_end, block))?;
        Ok(out)
    }

    fn build_boot_sector(&self, cluster_count: i64, fat_sectors: i64, reserved: i64, root_cluster: i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&[0xeb, 0x58, 0x90]);
        veneer_types::wire::put_padded(&mut out, self.oem_name.as_bytes(), 8, b' ');
        put_u16_le(&mut out, MAPPER_SECTOR as u16);
        out.push((self.block / MAPPER_SECTOR) as u8);
        put_u16_le(&mut out, reserved as u16);
        out.push(self.fat_count);
        put_zeros(&mut out, 4); // FAT12/16 root entry and sector limits
        out.push(0xf8); // media: fixed disk
        put_zeros(&mut out, 2); // sectors per FAT, pre-FAT32
        put_zeros(&mut out, 8); // CHS geometry and hidden sectors
        put_u32_le(&mut out, (cluster_count * self.block / MAPPER_SECTOR) as u32);
        put_u32_le(&mut out, fat_sectors as u32);
        put_zeros(&mut out, 2); // mirroring flags
        put_u16_le(&mut out, 0); // version
        put_u32_le(&mut out, root_cluster as u32);
        put_u16_le(&mut out, 1); // FS information sector
        put_u16_le(&mut out, 0); // no backup boot sector
        put_zeros(&mut out, 12);
        out.push(0); // drive number
        out.push(0);
        out.push(0x29); // extended boot signature
        put_u32_le(&mut out, label_crc32(&self.volume_label));
        veneer_types::wire::put_padded(&mut out, self.volume_label.as_bytes(), 11, b' ');
        veneer_types::wire::put_padded(&mut out, b"FAT32", 8, b' ');
        put_zeros(&mut out, 0x1fe - 0x5a);
        put_u16_le(&mut out, 0xaa55);
        debug_assert_eq!(out.len(), 512);
        out
    }

    fn build_info_sector(&self, free_clusters: u32, next_free: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(b"RRaA");
        put_zeros(&mut out, 480);
        out.extend_from_slice(b"rrAa");
        put_u32_le(&mut out, free_clusters);
        put_u32_le(&mut out, next_free);
        put_zeros(&mut out, 12);
        out.extend_from_slice(&[0, 0, 0x55, 0xaa]);
        debug_assert_eq!(out.len(), 512);
        out
    }
}

impl Default for VFat32Out {
    fn default() -> Self {
        Self::new()
    }
}

impl Volume for VFat32Out {
    fn size_range(&self) -> i64 {
        // 512-byte to 16 KiB clusters, per the cautious reading of the BPB
        63 * MAPPER_SECTOR
    }

    fn block_size(&self) -> i64 {
        self.block
    }

    fn set_block_size(&mut self, block: i64) {
        self.block = block;
    }

    fn set_labels(&mut self, system: &str, volume: &str) {
        if !system.is_empty() {
            self.oem_name = system.to_string();
        }
        self.volume_label = volume.to_string();
    }

    fn book_space(&mut self, scratch: bool, _scrooge: bool, extra: i64) {
        self.scratch = scratch;
        self.extra_room = extra;
    }

    fn plan(&mut self, tree: &Original, out: &mut Planner, tmp: &mut Planner) -> Result<Colonies> {
        let block = self.block;

        let mut cluster_count = self.cluster_count(tree);
        cluster_count = round_up(cluster_count, block / CLUSTER_LINK_SIZE);
        let fat_bytes = cluster_count * CLUSTER_LINK_SIZE;
        let fat_sectors = fat_bytes / MAPPER_SECTOR;
        info!(
            target: "veneer::fat32",
            clusters = cluster_count,
            fat_bytes,
            copies = self.fat_count,
            "FAT sized"
        );

        let fat = Arc::new(FatFill::new(self.scratch));
        fat.reserve(cluster_count);
        fat.set_media_flags();
        if !self.scratch {
            fat.set_last(cluster_count - 1)?;
        }

        // reserved sectors, then the FAT copies mapped from one scratch run
        let boot = SharedBuf::new(512);
        let info = SharedBuf::new(512);
        let reserved = self.plan_headers(tmp, &boot, &info)?;
        out.append(tmp.wrap_to_go(0)?)?;
        let fat_at = tmp.append(Extent::new(
            0,
            fat_bytes,
            Medium::rule(MediumId(0xfa7), Arc::clone(&fat) as Arc<dyn FillRule>),
        ))?;
        let fat_extent = tmp.wrap_to_go(fat_at)?;
        for _ in 0..self.fat_count {
            out.append(fat_extent.clone())?;
        }
        debug!(
            target: "veneer::fat32",
            out_offset = out.offset(),
            "reserved area and FATs planned"
        );

        // file payload; stepping the area base back two clusters makes
        // byte-to-cluster a plain division
        let mut colonies = tree.geometry.write_files(out)?;
        colonies.area_offset -= SEED_CLUSTERS * block;

        // cluster chains, each file's extents linked in reverse so every
        // run knows its successor
        for extents in tree.layout.values() {
            let mut iter = extents.iter().rev();
            if let Some(tail) = iter.next() {
                let mut current_first = first_block(colonies.within_area(tail), block);
                let tail_end = colonies.within_area(tail) + tail.length();
                fat.set_line(current_first, last_block(tail_end, block));
                fat.set_last(last_block(tail_end, block))?;
                for extent in iter {
                    let start = colonies.within_area(extent);
                    let first = first_block(start, block);
                    let last = last_block(start + extent.length(), block);
                    fat.set_line(first, last);
                    fat.set_next(last, current_first)?;
                    current_first = first;
                }
            }
        }

        // directories, leaves first
        let outer_off = out.offset();
        let inner_off = tmp.offset();
        let tmp_to_fat = (outer_off - inner_off) - colonies.area_offset;
        let dirs = self.prepare_directories(tree, tmp.offset() + tmp_to_fat);
        let placed: HashMap<EntryId, i64> = dirs
            .iter()
            .map(|dir| (dir.id, dir.offset_in_fat))
            .collect();
        let mut root_cluster = SEED_CLUSTERS;
        for dir in &dirs {
            debug_assert_eq!(dir.offset_in_fat, tmp.offset() + tmp_to_fat);
            let bytes = self.emit_directory(tree, &colonies, &fat, &placed, dir)?;
            if tree.entry(dir.id).parent.is_none() {
                root_cluster = first_block(dir.offset_in_fat, block);
            }
            let length = bytes.len() as i64;
            tmp.append(Extent::new(
                0,
                length,
                Medium::bytes(MediumId(0xd1f), bytes),
            ))?;
        }
        out.append(tmp.wrap_to_go(inner_off)?)?;
        out.auto_pad()?;

        // consume the remaining space the FAT claims
        let end_offset = out.offset() - (colonies.area_offset + SEED_CLUSTERS * block);
        let claimed = cluster_count * block;
        let extra = claimed - end_offset;
        debug!(
            target: "veneer::fat32",
            real = out.offset(),
            area = end_offset,
            claimed,
            "claim check"
        );
        if extra > 0 {
            out.append(Extent::zeroes(extra))?;
        } else if extra < 0 {
            return Err(VeneerError::assertion(format!(
                "FAT underflow: area {end_offset:#x} exceeds claimed {claimed:#x}"
            )));
        }

        let (free_clusters, next_free) = if self.scratch {
            (
                (extra / block) as u32,
                (end_offset / block + SEED_CLUSTERS) as u32,
            )
        } else {
            (0, (cluster_count - 1) as u32)
        };
        self.free_hints = Some((free_clusters, next_free));

        boot.fill(&self.build_boot_sector(cluster_count, fat_sectors, reserved, root_cluster));
        info.fill(&self.build_info_sector(free_clusters, next_free));
        if self.volume_label.is_empty() {
            warn!(target: "veneer::fat32", "volume has no label");
        }
        Ok(colonies)
    }
}
