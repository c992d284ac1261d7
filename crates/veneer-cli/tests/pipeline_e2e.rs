#![forbid(unsafe_code)]
//! End-to-end pipeline tests: build real trees in temp directories, produce
//! file-backed images, and read them back with minimal format parsers.

use std::fs;
use std::path::Path;
use veneer_burn::{Burner, FileBurner, TempBurner};
use veneer_extent::NoLocator;
use veneer_fat32::{VFat32Out, END_OF_CHAIN, MEDIA_MARK};
use veneer_hfsplus::HfsPlusOut;
use veneer_iso9660::Cd9660Out;
use veneer_source::Original;
use veneer_volume::{represent, Volume};

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

fn build_tree(root: &Path) -> Original {
    let mut tree = Original::new(Box::new(NoLocator));
    tree.geometry.gap = 0;
    tree.open_root(root).expect("tree");
    tree
}

fn burn(volume: &mut dyn Volume, tree: &mut Original, image: &Path) {
    let out: Box<dyn Burner> = Box::new(FileBurner::create(image).expect("target"));
    let tmp: Box<dyn Burner> = Box::new(TempBurner::new(1).expect("scratch"));
    represent(volume, tree, out, tmp).expect("represent");
}

// ── FAT32 ───────────────────────────────────────────────────────────────────

struct FatView<'a> {
    image: &'a [u8],
    cluster_size: i64,
    fat_offset: i64,
    area_offset: i64,
    root_cluster: i64,
}

impl<'a> FatView<'a> {
    fn open(image: &'a [u8]) -> Self {
        assert_eq!(&image[0x1fe..0x200], &[0x55, 0xaa]);
        assert_eq!(&image[0x52..0x5a], b"FAT32   ");
        let sector = i64::from(le16(image, 0x0b));
        assert_eq!(sector, 512);
        let cluster_size = sector * i64::from(image[0x0d]);
        let reserved = i64::from(le16(image, 0x0e));
        let fat_count = i64::from(image[0x10]);
        let fat_sectors = i64::from(le32(image, 0x24));
        let fat_offset = reserved * sector;
        let area_offset = fat_offset + fat_count * fat_sectors * sector;
        Self {
            image,
            cluster_size,
            fat_offset,
            area_offset,
            root_cluster: i64::from(le32(image, 0x2c)),
        }
    }

    fn fat(&self, index: i64) -> u32 {
        le32(self.image, (self.fat_offset + index * 4) as usize)
    }

    fn cluster(&self, index: i64) -> &[u8] {
        let at = (self.area_offset + (index - 2) * self.cluster_size) as usize;
        &self.image[at..at + self.cluster_size as usize]
    }

    /// Directory entries of one cluster: (raw 32-byte records).
    fn entries(&self, cluster: i64) -> Vec<&[u8]> {
        self.cluster(cluster)
            .chunks(32)
            .take_while(|rec| rec[0] != 0)
            .collect()
    }
}

#[test]
fn fat32_single_file_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("A.TXT"), b"hello world\n").unwrap();
    let image_path = work.path().join("out.img");

    let mut tree = build_tree(dir.path());
    let mut fat = VFat32Out::new();
    fat.set_titles("VENEER_OS", "MEDIA");
    fat.set_block_size(512);
    burn(&mut fat, &mut tree, &image_path);

    let image = fs::read(&image_path).unwrap();
    let view = FatView::open(&image);

    // chain law for the reserved entries
    assert_eq!(view.fat(0), MEDIA_MARK);
    assert_eq!(view.fat(1), END_OF_CHAIN);

    let root = view.entries(view.root_cluster);
    assert_eq!(root.len(), 2, "label and one file");
    assert_eq!(root[0][11], 0x08, "volume label first");
    assert_eq!(&root[0][0..11], b"MEDIA      ");

    let file = root[1];
    assert_eq!(&file[0..11], b"A       TXT");
    let start = i64::from(le16(file, 0x1a)) | (i64::from(le16(file, 0x14)) << 16);
    let size = le32(file, 0x1c) as usize;
    assert_eq!(size, 12);
    assert_eq!(&view.cluster(start)[..size], b"hello world\n");
    assert_eq!(view.fat(start), END_OF_CHAIN, "single-cluster chain");

    // the root directory cluster is chained and terminated too
    assert_eq!(view.fat(view.root_cluster), END_OF_CHAIN);
}

#[test]
fn fat32_long_names_get_chains_with_matching_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Über längerer Name.txt"), b"x").unwrap();
    let image_path = work.path().join("out.img");

    let mut tree = build_tree(dir.path());
    let mut fat = VFat32Out::new();
    fat.set_titles("VENEER_OS", "LFN");
    fat.set_block_size(512);
    burn(&mut fat, &mut tree, &image_path);

    let image = fs::read(&image_path).unwrap();
    let view = FatView::open(&image);
    let root = view.entries(view.root_cluster);

    // label, two LFN slots, one short entry
    let lfn: Vec<&&[u8]> = root.iter().filter(|rec| rec[11] == 0x0f).collect();
    assert_eq!(lfn.len(), 2);
    assert_eq!(lfn[0][0], 0x40 | 2, "chain starts with the last slice");
    assert_eq!(lfn[1][0], 1);

    let short = root.last().unwrap();
    assert_eq!(short[0], b' ', "synthetic short name leads with a space");
    let mut crc = 0_u8;
    for byte in &short[0..11] {
        crc = ((crc & 1) << 7).wrapping_add(crc >> 1).wrapping_add(*byte);
    }
    assert_eq!(lfn[0][13], crc);
    assert_eq!(lfn[1][13], crc);

    // first five UCS-2 characters of the first logical slice spell "Über "
    let decoded: Vec<u16> = (0..5)
        .map(|i| le16(lfn[1], 1 + 2 * i))
        .collect();
    let expected: Vec<u16> = "Über ".encode_utf16().collect();
    assert_eq!(decoded, expected);
}

// ── ISO-9660 ────────────────────────────────────────────────────────────────

struct IsoDirRecord {
    lba: u32,
    length: u32,
    flags: u8,
    name: Vec<u8>,
}

fn iso_records(data: &[u8]) -> Vec<IsoDirRecord> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < data.len() {
        let len = data[at] as usize;
        if len == 0 {
            // records never straddle sector boundaries; skip the pad
            at = (at / 2048 + 1) * 2048;
            continue;
        }
        let rec = &data[at..at + len];
        let name_len = rec[32] as usize;
        out.push(IsoDirRecord {
            lba: le32(rec, 2),
            length: le32(rec, 10),
            flags: rec[25],
            name: rec[33..33 + name_len].to_vec(),
        });
        at += len;
    }
    out
}

#[test]
fn iso9660_directory_and_path_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::create_dir(dir.path().join("zeta")).unwrap();
    fs::create_dir(dir.path().join("alpha")).unwrap();
    fs::write(dir.path().join("a.txt"), b"alpha contents\n").unwrap();
    fs::write(dir.path().join("sub/b.txt"), b"beta contents\n").unwrap();
    let image_path = work.path().join("out.iso");

    let mut tree = build_tree(dir.path());
    let mut iso = Cd9660Out::new(true);
    iso.set_titles("VENEER_OS", "TESTCD");
    burn(&mut iso, &mut tree, &image_path);

    let image = fs::read(&image_path).unwrap();

    // descriptor run: PVD, SVD, terminator
    assert_eq!(image[0x8000], 1);
    assert_eq!(&image[0x8001..0x8006], b"CD001");
    assert_eq!(image[0x8800], 2);
    assert_eq!(&image[0x8801..0x8806], b"CD001");
    assert_eq!(&image[0x8800 + 88..0x8800 + 91], b"%/@");
    assert_eq!(image[0x9000], 255);

    let pvd = &image[0x8000..0x8800];
    assert_eq!(le16(pvd, 128), 2048);
    let total_blocks = le32(pvd, 80);
    assert!(i64::from(total_blocks) * 2048 <= image.len() as i64);

    // root directory from the embedded record
    let root_lba = le32(pvd, 156 + 2) as usize;
    let root_len = le32(pvd, 156 + 10) as usize;
    let root = &image[root_lba * 2048..root_lba * 2048 + root_len];
    let records = iso_records(root);
    assert_eq!(records[0].name, [0x00], "dot first");
    assert_eq!(records[1].name, [0x01], "dotdot second");

    let file = records
        .iter()
        .find(|r| r.name == b"A.TXT;1")
        .expect("file record");
    let content =
        &image[file.lba as usize * 2048..file.lba as usize * 2048 + file.length as usize];
    assert_eq!(content, b"alpha contents\n");
    assert_eq!(file.flags & 0x80, 0, "single extent, no continuation");

    let sub = records
        .iter()
        .find(|r| r.name == b"SUB")
        .expect("folder record");
    assert_ne!(sub.flags & 0x02, 0, "folder flag");
    let sub_data = &image[sub.lba as usize * 2048..(sub.lba as usize * 2048 + sub.length as usize)];
    let sub_records = iso_records(sub_data);
    let nested = sub_records
        .iter()
        .find(|r| r.name == b"B.TXT;1")
        .expect("nested file");
    let nested_content = &image
        [nested.lba as usize * 2048..nested.lba as usize * 2048 + nested.length as usize];
    assert_eq!(nested_content, b"beta contents\n");

    // path table: root first, then the level-one directories in
    // non-decreasing identifier order with monotone parent indices
    let ptab_size = le32(pvd, 132) as usize;
    let ptab_lba = le32(pvd, 140) as usize;
    let ptab = &image[ptab_lba * 2048..ptab_lba * 2048 + ptab_size];
    assert_eq!(ptab[0], 1, "root identifier is one placeholder byte");
    assert_eq!(le16(ptab, 6), 1, "root is its own parent");
    let mut at = 8 + 2;
    let mut names = Vec::new();
    let mut parents = Vec::new();
    while at < ptab.len() {
        let name_len = ptab[at] as usize;
        parents.push(le16(ptab, at + 6));
        names.push(ptab[at + 8..at + 8 + name_len].to_vec());
        at += 8 + ((name_len + 1) & !1);
    }
    assert_eq!(names, vec![b"ALPHA".to_vec(), b"SUB".to_vec(), b"ZETA".to_vec()]);
    assert!(parents.windows(2).all(|w| w[0] <= w[1]));
    assert!(parents.iter().all(|&p| p == 1), "all level-one dirs hang off root");

    // Joliet names are UCS-2 big-endian
    let svd = &image[0x8800..0x9000];
    let jroot_lba = le32(svd, 156 + 2) as usize;
    let jroot_len = le32(svd, 156 + 10) as usize;
    let jroot = &image[jroot_lba * 2048..jroot_lba * 2048 + jroot_len];
    let jrecords = iso_records(jroot);
    let expected: Vec<u8> = "a.txt;1"
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect();
    assert!(
        jrecords.iter().any(|r| r.name == expected),
        "Joliet keeps the original case"
    );
}

// ── HFSX and the hybrid ─────────────────────────────────────────────────────

#[test]
fn hfsplus_standalone_headers_and_backup() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("Café.txt"), b"decomposed").unwrap();
    let image_path = work.path().join("out.hfs");

    let mut tree = build_tree(dir.path());
    let mut mac = HfsPlusOut::new();
    mac.set_titles("VENEER_OS", "MACVOL");
    burn(&mut mac, &mut tree, &image_path);

    let image = fs::read(&image_path).unwrap();

    // MBR with one HFS+ partition spanning the volume
    assert_eq!(&image[0x1fe..0x200], &[0x55, 0xaa]);
    assert_eq!(image[446 + 4], 0xaf);
    assert_eq!(
        le32(&image, 446 + 12) as usize * 512,
        image.len(),
        "partition spans the image"
    );

    // volume header and its backup
    assert_eq!(&image[0x400..0x402], b"HX");
    let total_blocks = be32(&image, 0x400 + 0x2c);
    let block_size = be32(&image, 0x400 + 0x28);
    assert_eq!(
        (total_blocks as usize) * (block_size as usize),
        image.len(),
        "header block count covers the image"
    );
    let backup_at = image.len() - 0x400;
    assert_eq!(&image[backup_at..backup_at + 2], b"HX");

    // catalog fork points at packed nodes whose first node is the header
    let catalog_fork_at = 0x400 + 112 + 160; // allocation, extents, then catalog
    let catalog_lba = be32(&image, catalog_fork_at + 16);
    let catalog_at = catalog_lba as usize * block_size as usize;
    assert_eq!(image[catalog_at + 8], 1, "header node kind");
}

#[test]
fn hybrid_regions_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("shared.bin"), vec![7_u8; 4096]).unwrap();
    let image_path = work.path().join("out.hybrid");

    let mut tree = build_tree(dir.path());
    let mut iso = Cd9660Out::new(true);
    iso.set_titles("VENEER_OS", "HYBRID");
    let mut mac = HfsPlusOut::new();
    mac.set_titles("VENEER_OS", "HYBRID");
    iso.set_hybrid(Box::new(mac));
    burn(&mut iso, &mut tree, &image_path);

    let image = fs::read(&image_path).unwrap();

    // [0, 0x200): the HFS+ MBR
    assert_eq!(&image[0x1fe..0x200], &[0x55, 0xaa]);
    assert_eq!(image[446 + 4], 0xaf);
    // [0x400, 0x600): the HFS+ volume header
    assert_eq!(&image[0x400..0x402], b"HX");
    // [0x8000, 0x8800): the ISO-9660 primary descriptor
    assert_eq!(image[0x8000], 1);
    assert_eq!(&image[0x8001..0x8006], b"CD001");

    // the backup volume header sits at the end of the disk
    let backup_at = image.len() - 0x400;
    assert_eq!(&image[backup_at..backup_at + 2], b"HX");

    // both views reference the same payload: find it through the ISO root
    let pvd = &image[0x8000..0x8800];
    let root_lba = le32(pvd, 156 + 2) as usize;
    let root_len = le32(pvd, 156 + 10) as usize;
    let records = iso_records(&image[root_lba * 2048..root_lba * 2048 + root_len]);
    let file = records
        .iter()
        .find(|r| r.name == b"SHARED.BIN;1")
        .expect("payload listed");
    let content = &image[file.lba as usize * 2048..file.lba as usize * 2048 + 4096];
    assert!(content.iter().all(|&b| b == 7));
}
