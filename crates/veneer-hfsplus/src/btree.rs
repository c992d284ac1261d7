//! Bottom-up HFS+ B-tree packing.
//!
//! Leaves are packed node by node under free-space accounting; when a leaf
//! spills, its first key is promoted to the next level, iterating until one
//! root node remains. Nodes chain through forward/backward links and carry
//! a reverse offset table at their end. The header node holds the header
//! record, a 128-byte user data record and a map record spanning its free
//! space; overflowing node bitmaps chain into dedicated map nodes.

use veneer_error::{Result, VeneerError};
use veneer_types::wire::{put_u16_be, put_u32_be, put_zeros};

pub const NODE_LEAF: i8 = -1;
pub const NODE_INDEX: i8 = 0;
pub const NODE_HEADER: i8 = 1;
pub const NODE_MAP: i8 = 2;

pub const KEY_COMPARE_UNUSED: u8 = 0;
pub const KEY_COMPARE_BINARY: u8 = 0xbc;

pub const ATTR_BIG_KEYS: u32 = 0x0000_0002;
pub const ATTR_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

const NODE_DESCRIPTOR_LEN: usize = 14;
const HEADER_RECORD_LEN: usize = 106;
const USER_DATA_LEN: usize = 128;
/// Descriptor + header record + user data + four offset slots.
const HEADER_NODE_USED: usize = 256;

/// A key serializable into its on-disk big-endian form.
pub trait HfsKey: Ord + Clone {
    fn key_bytes(&self) -> Vec<u8>;
}

/// One record held by a node: literal bytes, or a slice of the node-usage
/// bitmap whose final contents are only known once every node is counted.
enum NodeRecord {
    Plain(Vec<u8>),
    MapSlice { offset: usize, length: usize },
}

impl NodeRecord {
    fn len(&self) -> usize {
        match self {
            Self::Plain(bytes) => bytes.len(),
            Self::MapSlice { length, .. } => *length,
        }
    }
}

/// An in-assembly node: descriptor fields plus records.
struct NodeSpec {
    kind: i8,
    height: u8,
    fwd: u32,
    bwd: u32,
    records: Vec<NodeRecord>,
}

impl NodeSpec {
    fn new(kind: i8, height: u8) -> Self {
        Self {
            kind,
            height,
            fwd: 0,
            bwd: 0,
            records: Vec::new(),
        }
    }

    /// Bytes used: descriptor, records, and one offset slot per record plus
    /// the free-space slot.
    fn used(&self) -> usize {
        NODE_DESCRIPTOR_LEN
            + self.records.iter().map(NodeRecord::len).sum::<usize>()
            + 2 * (self.records.len() + 1)
    }

    /// Net free space: room left after reserving the next offset slot.
    fn free_space(&self, capacity: usize) -> usize {
        capacity - self.used() - 2
    }

    fn fits(&self, capacity: usize, record_len: usize) -> bool {
        self.used() + record_len + 2 <= capacity
    }

    fn serialize(&self, out: &mut Vec<u8>, capacity: usize, node_map: &[u8]) -> Result<()> {
        let start = out.len();
        put_u32_be(out, self.fwd);
        put_u32_be(out, self.bwd);
        out.push(self.kind as u8);
        out.push(self.height);
        put_u16_be(out, self.records.len() as u16);
        put_u16_be(out, 0);

        let mut offsets = vec![NODE_DESCRIPTOR_LEN as u16];
        for record in &self.records {
            match record {
                NodeRecord::Plain(bytes) => out.extend_from_slice(bytes),
                NodeRecord::MapSlice { offset, length } => {
                    let lo = (*offset).min(node_map.len());
                    let hi = (offset + length).min(node_map.len());
                    out.extend_from_slice(&node_map[lo..hi]);
                    put_zeros(out, length - (hi - lo));
                }
            }
            offsets.push((out.len() - start) as u16);
        }

        let table = 2 * offsets.len();
        let body = out.len() - start;
        if body + table > capacity {
            return Err(VeneerError::assertion(format!(
                "node body {body:#x} + offsets {table:#x} exceed node size {capacity:#x}"
            )));
        }
        put_zeros(out, capacity - body - table);
        // reverse offset table: record 0 lands in the final two bytes
        for off in offsets.iter().rev() {
            put_u16_be(out, *off);
        }
        Ok(())
    }
}

/// Packs one B-tree (catalog or extents overflow) from an ordered record
/// map into its on-disk file image.
pub struct TreeBuilder {
    pub node_size: usize,
    pub key_compare: u8,
    pub attributes: u32,
    pub max_key_len: u16,
    pub clump_size: u32,
    nodes: Vec<NodeSpec>,
    depth: u16,
    root_node: u32,
    leaf_records: u32,
    first_leaf: u32,
    last_leaf: u32,
}

impl TreeBuilder {
    /// Catalog tree: 8 KiB nodes, big variable keys, case-sensitive compare.
    #[must_use]
    pub fn for_catalog(max_key_len: u16) -> Self {
        Self::new(
            8 << 10,
            KEY_COMPARE_BINARY,
            ATTR_BIG_KEYS | ATTR_VARIABLE_INDEX_KEYS,
            max_key_len,
        )
    }

    /// Extents overflow tree: 4 KiB nodes, fixed big keys.
    #[must_use]
    pub fn for_overflow(max_key_len: u16) -> Self {
        Self::new(4 << 10, KEY_COMPARE_UNUSED, ATTR_BIG_KEYS, max_key_len)
    }

    fn new(node_size: usize, key_compare: u8, attributes: u32, max_key_len: u16) -> Self {
        let mut header = NodeSpec::new(NODE_HEADER, 0);
        header.records.push(NodeRecord::Plain(vec![0; HEADER_RECORD_LEN]));
        header.records.push(NodeRecord::Plain(vec![0; USER_DATA_LEN]));
        Self {
            node_size,
            key_compare,
            attributes,
            max_key_len,
            clump_size: 0,
            nodes: vec![header],
            depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf: 0,
            last_leaf: 0,
        }
    }

    pub fn set_clump_size(&mut self, clump: u32) {
        self.clump_size = clump;
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn compact_level<K: HfsKey>(
        &mut self,
        data: &[(K, Vec<u8>)],
        kind: i8,
        height: u8,
    ) -> Vec<(K, u32)> {
        let mut indices = Vec::new();
        let mut next = NodeSpec::new(kind, height);
        for (key, value) in data {
            let mut record = key.key_bytes();
            record.extend_from_slice(value);
            if !next.fits(self.node_size, record.len()) {
                let past = self.nodes.len() as u32;
                let mut full = std::mem::replace(&mut next, NodeSpec::new(kind, height));
                full.fwd = past + 1;
                next.bwd = past;
                self.nodes.push(full);
            }
            if next.records.is_empty() {
                indices.push((key.clone(), self.nodes.len() as u32));
            }
            next.records.push(NodeRecord::Plain(record));
        }
        self.nodes.push(next);
        indices
    }

    /// Pack the ordered `data` map bottom-up, then lay out the node bitmap.
    pub fn compact<K: HfsKey>(&mut self, data: &[(K, Vec<u8>)]) -> Result<()> {
        if !data.is_empty() {
            let mut height = 1_u8;
            self.first_leaf = self.nodes.len() as u32;
            let mut indices = self.compact_level(data, NODE_LEAF, height);
            self.last_leaf = self.nodes.len() as u32 - 1;
            self.leaf_records = data.len() as u32;

            while indices.len() > 1 {
                height += 1;
                let level: Vec<(K, Vec<u8>)> = indices
                    .into_iter()
                    .map(|(key, node)| (key, node.to_be_bytes().to_vec()))
                    .collect();
                indices = self.compact_level(&level, NODE_INDEX, height);
            }
            self.root_node = self.nodes.len() as u32 - 1;
            self.depth = u16::from(height);
        }

        // the header node is fully booked before the map record goes in
        let free = self.nodes[0].free_space(HEADER_NODE_USED);
        if free != 0 {
            return Err(VeneerError::assertion(format!(
                "header node free space {free:#x}, expected 0"
            )));
        }

        let mut done = 0_usize;
        let mut map_home = 0_usize;
        loop {
            let bits = self.nodes.len();
            let mset = self.nodes[map_home].free_space(self.node_size);
            self.nodes[map_home].records.push(NodeRecord::MapSlice {
                offset: done,
                length: mset,
            });
            done += mset;
            if done < bits.div_ceil(8) {
                let previous = if map_home == 0 { 0 } else { map_home as u32 };
                self.nodes[map_home].fwd = self.nodes.len() as u32;
                let mut map_node = NodeSpec::new(NODE_MAP, 0);
                map_node.bwd = previous;
                self.nodes.push(map_node);
                map_home = self.nodes.len() - 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn header_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_RECORD_LEN);
        put_u16_be(&mut out, self.depth);
        put_u32_be(&mut out, self.root_node);
        put_u32_be(&mut out, self.leaf_records);
        put_u32_be(&mut out, self.first_leaf);
        put_u32_be(&mut out, self.last_leaf);
        put_u16_be(&mut out, self.node_size as u16);
        put_u16_be(&mut out, self.max_key_len);
        put_u32_be(&mut out, self.nodes.len() as u32);
        put_u32_be(&mut out, 0); // free nodes: packed tightly
        put_u16_be(&mut out, 0);
        put_u32_be(&mut out, self.clump_size);
        out.push(0); // btree type: control file
        out.push(self.key_compare);
        put_u32_be(&mut out, self.attributes);
        put_zeros(&mut out, 64);
        debug_assert_eq!(out.len(), HEADER_RECORD_LEN);
        out
    }

    /// The finished tree file image.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        self.nodes[0].records[0] = NodeRecord::Plain(self.header_record());

        // node-usage bitmap: every node of this tree is in use
        let bits = self.nodes.len();
        let mut node_map = vec![0_u8; bits.div_ceil(8)];
        for bit in 0..bits {
            node_map[bit / 8] |= 0x80 >> (bit % 8);
        }

        let mut out = Vec::with_capacity(self.nodes.len() * self.node_size);
        for node in &self.nodes {
            node.serialize(&mut out, self.node_size, &node_map)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
    struct RawKey(Vec<u8>);

    impl HfsKey for RawKey {
        fn key_bytes(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    fn sample(count: usize, key_len: usize, value_len: usize) -> Vec<(RawKey, Vec<u8>)> {
        (0..count)
            .map(|i| {
                let mut key = vec![0_u8; key_len];
                key[..8].copy_from_slice(&(i as u64).to_be_bytes());
                (RawKey(key), vec![0xab; value_len])
            })
            .collect()
    }

    fn read_u16_be(buf: &[u8], at: usize) -> u16 {
        u16::from_be_bytes([buf[at], buf[at + 1]])
    }

    #[test]
    fn empty_tree_is_header_plus_map() {
        let mut tree = TreeBuilder::for_overflow(10);
        tree.compact::<RawKey>(&[]).unwrap();
        let bytes = tree.serialize().unwrap();
        assert_eq!(bytes.len(), 4096);
        // header node kind at byte 8
        assert_eq!(bytes[8] as i8, NODE_HEADER);
        // three records: header, user data, map
        assert_eq!(read_u16_be(&bytes, 10), 3);
        // record 0 offset in the final two bytes
        assert_eq!(read_u16_be(&bytes, 4094), 14);
    }

    #[test]
    fn offsets_read_backwards_strictly_decrease() {
        let mut tree = TreeBuilder::for_overflow(10);
        let data = sample(40, 12, 64);
        tree.compact(&data).unwrap();
        let bytes = tree.serialize().unwrap();
        let node_size = 4096;
        for node in bytes.chunks(node_size) {
            let records = read_u16_be(node, 10) as usize;
            // reading the trailing table backwards (record 0 first) gives
            // strictly increasing record offsets, i.e. strictly decreasing
            // byte addresses of the table entries themselves
            let mut last = None;
            for slot in 0..=records {
                let off = read_u16_be(node, node_size - 2 * (slot + 1));
                if let Some(prev) = last {
                    assert!(off > prev, "record offsets must grow record by record");
                }
                last = Some(off);
            }
        }
    }

    #[test]
    fn spilled_leaves_chain_and_promote() {
        let mut tree = TreeBuilder::for_overflow(10);
        // 12-byte keys + 64-byte records: far more than one 4k node
        let data = sample(200, 12, 64);
        tree.compact(&data).unwrap();
        assert!(tree.node_count() > 3);
        let bytes = tree.serialize().unwrap();
        let node_size = 4096;

        // header record: depth and root
        let header = &bytes[14..14 + 106];
        let depth = read_u16_be(header, 0);
        assert!(depth >= 2, "200 fat records need an index level");
        let first_leaf = u32::from_be_bytes(header[10..14].try_into().unwrap());
        assert_eq!(first_leaf, 1);

        // first leaf forward-links to the second
        let leaf = &bytes[node_size..2 * node_size];
        assert_eq!(leaf[8] as i8, NODE_LEAF);
        let fwd = u32::from_be_bytes(leaf[0..4].try_into().unwrap());
        assert_eq!(fwd, 2);
        let second = &bytes[2 * node_size..3 * node_size];
        let bwd = u32::from_be_bytes(second[4..8].try_into().unwrap());
        assert_eq!(bwd, 1);
    }

    #[test]
    fn header_free_space_is_exactly_zero() {
        // the structural constant behind the assertion: descriptor + header
        // record + user data + 4 offsets == 256
        let tree = TreeBuilder::for_catalog(516);
        assert_eq!(tree.nodes[0].free_space(HEADER_NODE_USED), 0);
    }
}
