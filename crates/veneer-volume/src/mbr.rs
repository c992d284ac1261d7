//! Master Boot Record serialization.
//!
//! One 512-byte sector: 446 bytes of boot-code space, four 16-byte
//! partition entries, the 0x55AA signature. CHS fields are synthesized
//! from LBAs with the conventional 255-head/63-sector translation.

use veneer_types::MAPPER_SECTOR;

pub const HFSPLUS_PARTITION_TYPE: u8 = 0xaf;
pub const ISO9660_PARTITION_TYPE: u8 = 0x96;
pub const FAT32_LBA_PARTITION_TYPE: u8 = 0x0c;

/// Cylinder/head/sector triple in the packed on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chs {
    pub cylinder: u32,
    pub head: u8,
    pub sector: u8,
}

impl Chs {
    #[must_use]
    pub fn from_lba(lba: u32) -> Self {
        Self {
            cylinder: lba / 63 / 255,
            head: ((lba / 63) % 255) as u8,
            sector: ((lba % 63) + 1) as u8,
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; 3] {
        let cyl = self.cylinder.min(0x3ff);
        [
            self.head,
            (self.sector & 0x3f) | (((cyl >> 8) as u8) << 6),
            (cyl & 0xff) as u8,
        ]
    }
}

/// One partition table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub bootable: bool,
    pub kind: u8,
    pub lba_start: u32,
    pub lba_count: u32,
}

impl Partition {
    fn to_bytes(self) -> [u8; 16] {
        let mut out = [0_u8; 16];
        out[0] = if self.bootable { 0x80 } else { 0 };
        out[1..4].copy_from_slice(&Chs::from_lba(self.lba_start).to_bytes());
        out[4] = self.kind;
        let last = self.lba_start + self.lba_count.saturating_sub(1);
        out[5..8].copy_from_slice(&Chs::from_lba(last).to_bytes());
        out[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        out[12..16].copy_from_slice(&self.lba_count.to_le_bytes());
        out
    }
}

/// The partition table sector.
#[derive(Debug, Default, Clone)]
pub struct Mbr {
    pub entries: [Option<Partition>; 4],
}

impl Mbr {
    /// A record with entry 0 spanning `total_bytes` of a `kind` volume.
    #[must_use]
    pub fn spanning(kind: u8, total_bytes: i64) -> Self {
        let mut mbr = Self::default();
        mbr.entries[0] = Some(Partition {
            bootable: true,
            kind,
            lba_start: 0,
            lba_count: (total_bytes / MAPPER_SECTOR) as u32,
        });
        mbr
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; MAPPER_SECTOR as usize];
        for (index, slot) in self.entries.iter().enumerate() {
            if let Some(partition) = slot {
                let at = 446 + index * 16;
                out[at..at + 16].copy_from_slice(&partition.to_bytes());
            }
        }
        out[510] = 0x55;
        out[511] = 0xaa;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_and_size() {
        let bytes = Mbr::default().to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[510..], &[0x55, 0xaa]);
    }

    #[test]
    fn spanning_entry_encodes_lba_fields() {
        let mbr = Mbr::spanning(HFSPLUS_PARTITION_TYPE, 1 << 20);
        let bytes = mbr.to_bytes();
        assert_eq!(bytes[446], 0x80);
        assert_eq!(bytes[446 + 4], 0xaf);
        assert_eq!(
            u32::from_le_bytes(bytes[446 + 12..446 + 16].try_into().unwrap()),
            2048
        );
    }

    #[test]
    fn chs_translation() {
        let chs = Chs::from_lba(0);
        assert_eq!(chs, Chs { cylinder: 0, head: 0, sector: 1 });
        let far = Chs::from_lba(16450559);
        assert!(far.cylinder >= 1023);
    }
}
