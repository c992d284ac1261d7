#![forbid(unsafe_code)]
//! ISO-9660 (ECMA-119) + Joliet volume writer.
//!
//! Receives the source tree and lays out a CD filesystem: reserved system
//! area, volume descriptors, file payload by extent reference, then per
//! volume (primary, Joliet supplement) the directory data and both path
//! tables. Directory placement is computed in a measuring pass first, so
//! every record is emitted with its final extent locations — the deferred
//! fixups of a streaming writer become plain lookups.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use veneer_burn::Planner;
use veneer_error::{Result, VeneerError};
use veneer_extent::{Extent, Medium, SharedBuf};
use veneer_geometry::Colonies;
use veneer_name::{pack_ansi, pack_ucs2_be, Delimited, LegacyRand, NamePool, NameRule};
use veneer_source::{EntryId, Original};
use veneer_types::wire::{put_padded, put_u16_both, put_u32_be, put_u32_both, put_u32_le, put_u8, put_zeros};
use veneer_types::{padding, round_up, MediumId, Timespec};
use veneer_volume::{plan_reserved, Hybrid, Volume};

/// The CD logical sector: the only block size ISO-9660 admits here.
pub const CD_BLOCK: i64 = 2048;
/// Path tables are capped at 64 KiB of entries.
pub const PATH_TABLE_CAP: usize = 1 << 16;
/// Bytes reserved at the start of the image (system area).
pub const SYSTEM_AREA: i64 = 0x8000;

const VD_PRIMARY: u8 = 1;
const VD_SUPPLEMENTARY: u8 = 2;
const VD_TERMINATOR: u8 = 255;

const FLAG_FOLDER: u8 = 1 << 1;
const FLAG_CONTINUES: u8 = 1 << 7;

// ── Timestamps ──────────────────────────────────────────────────────────────

/// 17-byte decimal form used in volume descriptors: 16 digits + tz offset
/// in quarter hours biased by 48. Times are rendered in UTC.
fn push_long_date(out: &mut Vec<u8>, ts: Option<Timespec>) {
    match ts {
        Some(ts) => {
            let c = ts.civil();
            let text = format!(
                "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
                c.year.clamp(0, 9999),
                c.month,
                c.day,
                c.hour,
                c.minute,
                c.second,
                ts.centis()
            );
            out.extend_from_slice(text.as_bytes());
            out.push(48);
        }
        None => {
            out.extend_from_slice(&[b'0'; 16]);
            out.push(0);
        }
    }
}

/// 7-byte form used in directory records: offset years since 1900.
fn push_entry_date(out: &mut Vec<u8>, ts: Timespec) {
    let c = ts.civil();
    out.push((c.year - 1900).clamp(0, 255) as u8);
    out.push(c.month as u8);
    out.push(c.day as u8);
    out.push(c.hour as u8);
    out.push(c.minute as u8);
    out.push(c.second as u8);
    out.push(48);
}

// ── Directory records ───────────────────────────────────────────────────────

/// Size of a record carrying `name_len` identifier bytes: 33 fixed bytes,
/// the name, and a pad byte keeping the next record even-aligned.
#[must_use]
fn record_size(name_len: usize) -> usize {
    (34 + name_len) & !1
}

fn push_record(out: &mut Vec<u8>, name: &[u8], lba: u32, length: u32, flags: u8, ts: Timespec) {
    let start = out.len();
    put_u8(out, record_size(name.len()) as u8);
    put_u8(out, 0); // extended attribute length
    put_u32_both(out, lba);
    put_u32_both(out, length);
    push_entry_date(out, ts);
    put_u8(out, flags);
    put_u8(out, 0); // interleave unit
    put_u8(out, 0); // interleave gap
    put_u16_both(out, 1); // volume sequence number
    put_u8(out, name.len() as u8);
    out.extend_from_slice(name);
    if out.len() % 2 != 0 {
        put_u8(out, 0);
    }
    debug_assert_eq!(out.len() - start, record_size(name.len()));
}

/// The 34-byte self record embedded in a volume descriptor.
fn root_record(lba: u32, length: u32, ts: Timespec) -> Vec<u8> {
    let mut out = Vec::with_capacity(34);
    push_record(&mut out, &[0], lba, length, FLAG_FOLDER, ts);
    out
}

// ── Per-volume generation state ─────────────────────────────────────────────

#[derive(Clone, Copy)]
enum VolKind {
    Primary,
    Supplementary,
}

impl VolKind {
    fn rule(self) -> NameRule {
        match self {
            Self::Primary => NameRule::primary_volume(),
            Self::Supplementary => NameRule::joliet_volume(),
        }
    }

    fn pack(self, chars: &[char]) -> Vec<u8> {
        match self {
            Self::Primary => pack_ansi(chars),
            Self::Supplementary => pack_ucs2_be(chars),
        }
    }
}

struct PreparedChild {
    child: EntryId,
    enc: Vec<u8>,
}

struct PreparedDir {
    id: EntryId,
    /// Target-device byte offset of the directory extent.
    offset: i64,
    /// Unpadded directory data size.
    raw_size: i64,
    children: Vec<PreparedChild>,
}

struct VolumeLayout {
    kind: VolKind,
    dirs: Vec<PreparedDir>,
    /// id -> (target offset, padded length) for parent/self references.
    placed: HashMap<EntryId, (i64, i64)>,
    /// Directory name encodings for the path table, childless root included.
    dir_names: HashMap<EntryId, (Vec<char>, Vec<u8>)>,
    root_extent: (i64, i64),
    path_table_size: u32,
    lsb_lba: u32,
    msb_lba: u32,
}

// ── The writer ──────────────────────────────────────────────────────────────

/// ISO-9660 + Joliet volume writer; optionally the master of an HFS+ hybrid
/// sharing the same file area.
pub struct Cd9660Out {
    block: i64,
    with_unicode: bool,
    system_id: String,
    volume_id: String,
    name_seed: u64,
    hybrid: Option<Box<dyn Hybrid>>,
    build_time: Timespec,
}

impl Cd9660Out {
    #[must_use]
    pub fn new(with_unicode: bool) -> Self {
        Self {
            block: CD_BLOCK,
            with_unicode,
            system_id: String::new(),
            volume_id: String::new(),
            name_seed: 1,
            hybrid: None,
            build_time: Timespec::now(),
        }
    }

    /// Attach a slave filesystem co-describing the same file area.
    pub fn set_hybrid(&mut self, slave: Box<dyn Hybrid>) {
        self.hybrid = Some(slave);
    }

    pub fn set_name_seed(&mut self, seed: u64) {
        self.name_seed = seed;
    }

    fn volume_kinds(&self) -> Vec<VolKind> {
        if self.with_unicode {
            vec![VolKind::Primary, VolKind::Supplementary]
        } else {
            vec![VolKind::Primary]
        }
    }

    /// Measure every directory of one volume and fix its extent placement.
    fn prepare_volume(
        &self,
        tree: &Original,
        kind: VolKind,
        first_offset: i64,
    ) -> VolumeLayout {
        let rule = kind.rule();
        let mut variants = LegacyRand::new(self.name_seed);
        let mut dirs = Vec::new();
        let mut placed = HashMap::new();
        let mut dir_names = HashMap::new();
        let mut pos = first_offset;

        for &dir_id in tree.path_table.iter().rev() {
            let node = tree.entry(dir_id);
            let mut pool = NamePool::new();
            let mut sorted: BTreeMap<Delimited, EntryId> = BTreeMap::new();
            for &child in node.children() {
                let child_node = tree.entry(child);
                let fitted =
                    pool.fit_name(&child_node.name, child_node.is_file(), &rule, &mut variants);
                sorted.insert(fitted, child);
            }

            let mut children = Vec::with_capacity(sorted.len());
            let mut cur = 34_i64 + 34; // the `.` and `..` records
            for (fitted, child) in sorted {
                let enc = kind.pack(&fitted.conv);
                let records = if tree.entry(child).is_dir() {
                    1
                } else {
                    tree.layout.get(&child).map(Vec::len).unwrap_or(0).max(1)
                };
                let rec = record_size(enc.len()) as i64;
                for _ in 0..records {
                    let pad = padding(cur, self.block);
                    if rec > pad {
                        cur += pad;
                    }
                    cur += rec;
                }
                if tree.entry(child).is_dir() {
                    dir_names.insert(child, (fitted.conv.clone(), enc.clone()));
                }
                children.push(PreparedChild { child, enc });
            }

            placed.insert(dir_id, (pos, round_up(cur, self.block)));
            dirs.push(PreparedDir {
                id: dir_id,
                offset: pos,
                raw_size: cur,
                children,
            });
            pos += round_up(cur, self.block);
        }

        // the root directory identifier is a single placeholder byte
        if let Some(root) = tree.root {
            dir_names.insert(root, (vec!['\u{0}'], vec![0]));
        }

        let root_extent = tree
            .root
            .and_then(|root| placed.get(&root).copied())
            .unwrap_or((first_offset, 0));

        VolumeLayout {
            kind,
            dirs,
            placed,
            dir_names,
            root_extent,
            path_table_size: 0,
            lsb_lba: 0,
            msb_lba: 0,
        }
    }

    /// Emit one prepared directory's data.
    fn emit_directory(
        &self,
        tree: &Original,
        colonies: &Colonies,
        layout: &VolumeLayout,
        dir: &PreparedDir,
    ) -> Result<Vec<u8>> {
        let block = self.block;
        let node = tree.entry(dir.id);
        let (own_offset, own_len) = layout.placed[&dir.id];
        let parent_id = node.parent.unwrap_or(dir.id);
        let (parent_offset, parent_len) = layout.placed[&parent_id];

        let mut out = Vec::with_capacity(dir.raw_size as usize);
        push_record(
            &mut out,
            &[0x00],
            (own_offset / block) as u32,
            own_len as u32,
            FLAG_FOLDER,
            node.stat.mtime,
        );
        push_record(
            &mut out,
            &[0x01],
            (parent_offset / block) as u32,
            parent_len as u32,
            FLAG_FOLDER,
            tree.entry(parent_id).stat.mtime,
        );

        let push_fitted = |out: &mut Vec<u8>, enc: &[u8], lba, length, flags, ts| {
            let rec = record_size(enc.len()) as i64;
            let pad = padding(out.len() as i64, block);
            if rec > pad {
                put_zeros(out, pad as usize);
            }
            push_record(out, enc, lba, length, flags, ts);
        };

        for prepared in &dir.children {
            let child = tree.entry(prepared.child);
            if child.is_dir() {
                let (child_offset, child_len) = layout.placed[&prepared.child];
                push_fitted(
                    &mut out,
                    &prepared.enc,
                    (child_offset / block) as u32,
                    child_len as u32,
                    FLAG_FOLDER,
                    child.stat.mtime,
                );
            } else {
                let extents = tree
                    .layout
                    .get(&prepared.child)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                if extents.is_empty() {
                    push_fitted(&mut out, &prepared.enc, 0, 0, 0, child.stat.mtime);
                    continue;
                }
                let mut remaining = child.stat.size;
                for extent in extents {
                    let target = colonies.within_disk(extent);
                    let flags = if remaining <= extent.length() {
                        0
                    } else {
                        FLAG_CONTINUES
                    };
                    push_fitted(
                        &mut out,
                        &prepared.enc,
                        (target / block) as u32,
                        remaining.min(extent.length()) as u32,
                        flags,
                        child.stat.mtime,
                    );
                    remaining -= extent.length();
                }
            }
        }

        if out.len() as i64 != dir.raw_size {
            return Err(VeneerError::assertion(format!(
                "directory measured {:#x} but emitted {:#x} bytes",
                dir.raw_size,
                out.len()
            )));
        }
        out.resize(round_up(dir.raw_size, block) as usize, 0);
        Ok(out)
    }

    /// Breadth-first path table of one volume, both byte orders.
    fn build_path_tables(
        &self,
        tree: &Original,
        layout: &VolumeLayout,
    ) -> (Vec<u8>, Vec<u8>) {
        let mut lsb = Vec::new();
        let mut msb = Vec::new();
        let Some(root) = tree.root else {
            return (lsb, msb);
        };

        // (parent number, sort name, directory); numbers are assigned in
        // emission order, so each level is sorted before numbering
        let mut level: Vec<(u16, Vec<char>, EntryId)> = vec![(1, Vec::new(), root)];
        let mut number = 1_u16;
        while !level.is_empty() {
            level.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            let mut next = Vec::new();
            for (parent_no, _, dir) in level {
                let enc = layout
                    .dir_names
                    .get(&dir)
                    .map(|(_, enc)| enc.clone())
                    .unwrap_or_else(|| vec![0]);
                let entry_len = 8 + ((enc.len() + 1) & !1);
                if lsb.len() + entry_len > PATH_TABLE_CAP {
                    warn!(
                        target: "veneer::iso9660",
                        "path table full, remaining directories unlisted"
                    );
                    next.clear();
                    break;
                }
                let (offset, _) = layout.placed[&dir];
                let lba = (offset / self.block) as u32;
                push_path_entry(&mut lsb, &enc, lba, parent_no, true);
                push_path_entry(&mut msb, &enc, lba, parent_no, false);
                let my_no = number;
                number = number.saturating_add(1);
                for &child in tree.entry(dir).children() {
                    if tree.entry(child).is_dir() {
                        let key = layout
                            .dir_names
                            .get(&child)
                            .map(|(chars, _)| chars.clone())
                            .unwrap_or_default();
                        next.push((my_no, key, child));
                    }
                }
            }
            level = next;
        }
        (lsb, msb)
    }

    /// One 2048-byte volume descriptor, complete.
    fn build_descriptor(&self, layout: &VolumeLayout, total_blocks: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(CD_BLOCK as usize);
        let (kind_byte, escape): (u8, &[u8]) = match layout.kind {
            VolKind::Primary => (VD_PRIMARY, b""),
            VolKind::Supplementary => (VD_SUPPLEMENTARY, b"%/@"),
        };
        let wide = matches!(layout.kind, VolKind::Supplementary);

        put_u8(&mut out, kind_byte);
        out.extend_from_slice(b"CD001");
        put_u8(&mut out, 1); // version
        put_u8(&mut out, 0); // flags
        push_label(&mut out, &self.system_id, 32, wide);
        push_label(&mut out, &self.volume_id, 32, wide);
        put_zeros(&mut out, 8);
        put_u32_both(&mut out, total_blocks);
        put_padded(&mut out, escape, 32, 0);
        put_u16_both(&mut out, 1); // volume set size
        put_u16_both(&mut out, 1); // volume sequence number
        put_u16_both(&mut out, self.block as u16);
        put_u32_both(&mut out, layout.path_table_size);
        put_u32_le(&mut out, layout.lsb_lba);
        put_u32_le(&mut out, 0); // optional L table
        put_u32_be(&mut out, layout.msb_lba);
        put_u32_be(&mut out, 0); // optional M table
        let (root_offset, root_len) = layout.root_extent;
        out.extend_from_slice(&root_record(
            (root_offset / self.block) as u32,
            root_len as u32,
            self.build_time,
        ));
        push_label(&mut out, "", 128, wide); // volume set
        push_label(&mut out, "", 128, wide); // publisher
        push_label(&mut out, "", 128, wide); // data preparer
        push_label(&mut out, "", 128, wide); // application
        push_label(&mut out, "", 37, wide); // copyright file
        push_label(&mut out, "", 37, wide); // abstract file
        push_label(&mut out, "", 37, wide); // bibliographic file
        push_long_date(&mut out, Some(self.build_time)); // creation
        push_long_date(&mut out, Some(self.build_time)); // modification
        push_long_date(&mut out, None); // expiration
        push_long_date(&mut out, Some(Timespec::default())); // effective
        put_u8(&mut out, 1); // file structure version
        out.resize(CD_BLOCK as usize, 0);
        out
    }
}

fn push_path_entry(out: &mut Vec<u8>, enc: &[u8], lba: u32, parent: u16, little: bool) {
    out.push(enc.len() as u8);
    out.push(0); // extended attribute length
    if little {
        out.extend_from_slice(&lba.to_le_bytes());
        out.extend_from_slice(&parent.to_le_bytes());
    } else {
        out.extend_from_slice(&lba.to_be_bytes());
        out.extend_from_slice(&parent.to_be_bytes());
    }
    out.extend_from_slice(enc);
    if enc.len() % 2 != 0 {
        out.push(0);
    }
}

/// Descriptor text field: ASCII space-padded, or the same text diluted to
/// UCS-2 big-endian within the same byte width for the Joliet descriptor.
fn push_label(out: &mut Vec<u8>, text: &str, width: usize, wide: bool) {
    if wide {
        let padded: Vec<char> = text
            .chars()
            .chain(std::iter::repeat(' '))
            .take(width / 2)
            .collect();
        out.extend_from_slice(&pack_ucs2_be(&padded));
    } else {
        put_padded(out, text.as_bytes(), width, b' ');
    }
}

impl Volume for Cd9660Out {
    fn size_range(&self) -> i64 {
        CD_BLOCK
    }

    fn block_size(&self) -> i64 {
        self.block
    }

    fn set_block_size(&mut self, block: i64) {
        self.block = block;
    }

    fn set_labels(&mut self, system: &str, volume: &str) {
        self.system_id = system.to_string();
        self.volume_id = volume.to_string();
    }

    fn hybrid_mut(&mut self) -> Option<&mut (dyn Hybrid + 'static)> {
        self.hybrid.as_deref_mut()
    }

    fn plan(&mut self, tree: &Original, out: &mut Planner, tmp: &mut Planner) -> Result<Colonies> {
        let block = self.block;

        // system area: zeroes, or whatever the hybrid slave wants there
        plan_reserved(self.hybrid.as_deref_mut(), tree, out, tmp, SYSTEM_AREA)?;

        // volume descriptors, filled in at the end of planning
        let header_start = tmp.offset();
        let mut descriptor_bufs = Vec::new();
        for _ in self.volume_kinds() {
            let buf = SharedBuf::new(CD_BLOCK as usize);
            tmp.append(Extent::new(
                0,
                CD_BLOCK,
                Medium::shared(MediumId(0xcd00 + descriptor_bufs.len() as u64), buf.clone()),
            ))?;
            tmp.pad_to(block)?;
            descriptor_bufs.push(buf);
        }
        let mut terminator = vec![VD_TERMINATOR];
        terminator.extend_from_slice(b"CD001");
        terminator.push(1);
        terminator.resize(CD_BLOCK as usize, 0);
        tmp.append(Extent::new(
            0,
            CD_BLOCK,
            Medium::bytes(MediumId(0xcdff), terminator),
        ))?;
        tmp.pad_to(block)?;
        let wrapped_headers = tmp.wrap_to_go(header_start)?;
        out.append(wrapped_headers)?;
        out.auto_pad()?;

        // file payload first; metadata follows it
        let colonies = tree.geometry.write_files(out)?;
        debug!(
            target: "veneer::iso9660",
            out_offset = out.offset(),
            tmp_offset = tmp.offset(),
            "file area written"
        );

        let inner_off = tmp.offset();
        let tmp_to_out = out.offset() - inner_off;
        let mut layouts = Vec::new();
        for kind in self.volume_kinds() {
            let mut layout = self.prepare_volume(tree, kind, tmp.offset() + tmp_to_out);
            // directory data, leaves first
            for index in 0..layout.dirs.len() {
                let bytes = {
                    let dir = &layout.dirs[index];
                    debug_assert_eq!(dir.offset, tmp.offset() + tmp_to_out);
                    self.emit_directory(tree, &colonies, &layout, dir)?
                };
                let id = MediumId(0xd1c0_0000 + index as u64);
                let length = bytes.len() as i64;
                tmp.append(Extent::new(0, length, Medium::bytes(id, bytes)))?;
            }
            // both path tables
            let (lsb, msb) = self.build_path_tables(tree, &layout);
            layout.path_table_size = lsb.len() as u32;
            let lsb_off = tmp.append(Extent::new(
                0,
                lsb.len() as i64,
                Medium::bytes(MediumId(0x97ab), lsb),
            ))?;
            tmp.pad_to(block)?;
            let msb_off = tmp.append(Extent::new(
                0,
                msb.len() as i64,
                Medium::bytes(MediumId(0x97ac), msb),
            ))?;
            tmp.pad_to(block)?;
            layout.lsb_lba = ((lsb_off + tmp_to_out) / block) as u32;
            layout.msb_lba = ((msb_off + tmp_to_out) / block) as u32;
            layouts.push(layout);
        }

        out.append(tmp.wrap_to_go(inner_off)?)?;
        out.auto_pad()?;

        let total_blocks = (out.offset() / block) as u32;
        for (layout, buf) in layouts.iter().zip(&descriptor_bufs) {
            buf.fill(&self.build_descriptor(layout, total_blocks));
        }
        Ok(colonies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_stay_even() {
        assert_eq!(record_size(1), 34);
        assert_eq!(record_size(10), 44);
        assert_eq!(record_size(11), 44);
        assert_eq!(record_size(12), 46);
    }

    #[test]
    fn record_layout_fields() {
        let mut out = Vec::new();
        push_record(
            &mut out,
            b"HELLO.TXT;1",
            0x10,
            0x2000,
            0,
            Timespec::new(0, 0),
        );
        assert_eq!(out.len(), 44);
        assert_eq!(out[0], 44);
        // both-endian LBA
        assert_eq!(&out[2..6], &0x10_u32.to_le_bytes());
        assert_eq!(&out[6..10], &0x10_u32.to_be_bytes());
        // name
        assert_eq!(out[32], 11);
        assert_eq!(&out[33..44], b"HELLO.TXT;1");
    }

    #[test]
    fn long_date_epoch() {
        let mut out = Vec::new();
        push_long_date(&mut out, Some(Timespec::new(0, 0)));
        assert_eq!(&out[..16], b"1970010100000000");
        assert_eq!(out[16], 48);
        let mut cleared = Vec::new();
        push_long_date(&mut cleared, None);
        assert_eq!(&cleared[..16], [b'0'; 16]);
        assert_eq!(cleared[16], 0);
    }

    #[test]
    fn path_entry_pads_names_to_even() {
        let mut lsb = Vec::new();
        push_path_entry(&mut lsb, b"SUB", 5, 1, true);
        assert_eq!(lsb.len(), 8 + 4);
        assert_eq!(lsb[0], 3);
        assert_eq!(&lsb[2..6], &5_u32.to_le_bytes());
        assert_eq!(&lsb[6..8], &1_u16.to_le_bytes());
        assert_eq!(&lsb[8..11], b"SUB");
        assert_eq!(lsb[11], 0);
    }

    #[test]
    fn descriptor_is_one_block_with_signature() {
        let writer = Cd9660Out::new(true);
        let layout = VolumeLayout {
            kind: VolKind::Primary,
            dirs: Vec::new(),
            placed: HashMap::new(),
            dir_names: HashMap::new(),
            root_extent: (0x8800, 0x800),
            path_table_size: 10,
            lsb_lba: 20,
            msb_lba: 21,
        };
        let bytes = writer.build_descriptor(&layout, 100);
        assert_eq!(bytes.len(), 2048);
        assert_eq!(bytes[0], VD_PRIMARY);
        assert_eq!(&bytes[1..6], b"CD001");
        // logical block size, both-endian at offset 128
        assert_eq!(&bytes[128..130], &2048_u16.to_le_bytes());
        assert_eq!(&bytes[130..132], &2048_u16.to_be_bytes());
        // root record begins at 156 with length byte 34
        assert_eq!(bytes[156], 34);
    }
}
