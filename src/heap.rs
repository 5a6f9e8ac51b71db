//! Heap-on-Node decoder: variably sized items layered on a node's block
//! tree, addressed by composite heap ids, plus the BTH mini B-tree that
//! the PC and TC structures are built from.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::BlockReader;
use crate::error::{PstError, Result};
use crate::index::NodeEntry;

pub const HN_SIGNATURE: u8 = 0xEC;
pub const CLIENT_SIG_TC: u8 = 0x7C;
pub const CLIENT_SIG_BTH: u8 = 0xB5;
pub const CLIENT_SIG_PC: u8 = 0xBC;

/// Heap id layout: 5 type bits (always zero), an 11-bit one-based item
/// index, and a 16-bit block index.
pub fn hid_item(hid: u32) -> usize {
    ((hid >> 5) & 0x7FF) as usize
}

pub fn hid_block(hid: u32) -> usize {
    (hid >> 16) as usize
}

/// An HNID is a heap id or a sub-node id, discriminated by the type bits.
pub fn hnid_is_hid(hnid: u32) -> bool {
    hnid & 0x1F == 0
}

// ── HeapNode ─────────────────────────────────────────────────────────────────

pub struct HeapNode {
    blocks: Vec<Vec<u8>>,
    client_sig: u8,
    user_root: u32,
}

impl HeapNode {
    /// Reads and flattens the node's block tree, then validates the heap
    /// header in the first block.
    pub fn read(reader: &BlockReader, node: &NodeEntry) -> Result<Self> {
        let blocks = reader.read_data_tree(node.bid_data)?;
        Self::parse(blocks)
    }

    pub fn parse(blocks: Vec<Vec<u8>>) -> Result<Self> {
        let first = blocks
            .first()
            .ok_or_else(|| PstError::CorruptBlock("heap node without blocks".into()))?;
        if first.len() < 8 {
            return Err(PstError::CorruptBlock("heap header truncated".into()));
        }
        if first[2] != HN_SIGNATURE {
            return Err(PstError::CorruptBlock(format!(
                "bad heap signature {:#04x}",
                first[2]
            )));
        }
        let client_sig = first[3];
        let user_root = u32::from_le_bytes([first[4], first[5], first[6], first[7]]);
        Ok(Self {
            blocks,
            client_sig,
            user_root,
        })
    }

    pub fn client_sig(&self) -> u8 {
        self.client_sig
    }

    /// Heap id of the client root structure (PC property tree, TCINFO).
    pub fn user_root(&self) -> u32 {
        self.user_root
    }

    /// Resolves a heap id to its byte range through the per-block item
    /// directory. Item 0 of the first block is the header and can never be
    /// addressed; an index past the directory is corruption, not an
    /// out-of-range read.
    pub fn item(&self, hid: u32) -> Result<&[u8]> {
        if !hnid_is_hid(hid) {
            return Err(PstError::CorruptBlock(format!(
                "heap id {hid:#x} carries type bits"
            )));
        }
        let item = hid_item(hid);
        let block_idx = hid_block(hid);
        if item == 0 {
            return Err(PstError::CorruptBlock("heap id addresses item zero".into()));
        }
        let block = self.blocks.get(block_idx).ok_or_else(|| {
            PstError::CorruptBlock(format!("heap id {hid:#x} addresses a missing block"))
        })?;

        // The allocation directory lives at the offset stored in the first
        // two bytes of every heap block.
        if block.len() < 2 {
            return Err(PstError::CorruptBlock("heap block truncated".into()));
        }
        let map_off = u16::from_le_bytes([block[0], block[1]]) as usize;
        let dir = block.get(map_off..).ok_or_else(|| {
            PstError::CorruptBlock("heap allocation directory out of bounds".into())
        })?;
        if dir.len() < 4 {
            return Err(PstError::CorruptBlock(
                "heap allocation directory truncated".into(),
            ));
        }
        let mut cur = Cursor::new(dir);
        let alloc_count = cur.read_u16::<LittleEndian>()? as usize;
        let _free_count = cur.read_u16::<LittleEndian>()?;
        if item > alloc_count {
            return Err(PstError::CorruptBlock(format!(
                "heap id {hid:#x} past the item directory ({item} > {alloc_count})"
            )));
        }
        if dir.len() < 4 + 2 * (alloc_count + 1) {
            return Err(PstError::CorruptBlock(format!(
                "heap allocation directory truncated ({alloc_count} entries)"
            )));
        }
        let mut offsets = Vec::with_capacity(alloc_count + 1);
        for _ in 0..=alloc_count {
            offsets.push(cur.read_u16::<LittleEndian>()? as usize);
        }
        let start = offsets[item - 1];
        let end = offsets[item];
        if start > end || end > block.len() {
            return Err(PstError::CorruptBlock(format!(
                "heap item {hid:#x} has a bad extent {start}..{end}"
            )));
        }
        Ok(&block[start..end])
    }
}

/// Resolves an HNID to bytes: either a heap item of this node, or a whole
/// sub-node's data read through the node index. The indirection is
/// invisible to PC/TC callers.
pub fn resolve_hnid(
    reader: &BlockReader,
    node: &NodeEntry,
    heap: &HeapNode,
    hnid: u32,
) -> Result<Vec<u8>> {
    if hnid_is_hid(hnid) {
        return Ok(heap.item(hnid)?.to_vec());
    }
    let entry = reader.sub_node_entry(node.bid_sub, hnid)?.ok_or_else(|| {
        PstError::CorruptBlock(format!("dangling sub-node reference {hnid:#x}"))
    })?;
    reader.read_node_data(entry.bid_data)
}

// ── BTH ──────────────────────────────────────────────────────────────────────

/// A BTH flattened into its sorted leaf records. PCs and TC row indexes
/// are small enough that collecting the leaves up front beats re-walking
/// the tree per lookup.
pub struct BthTable {
    key_size: usize,
    entry_size: usize,
    records: Vec<Vec<u8>>,
}

const MAX_BTH_DEPTH: usize = 8;

impl BthTable {
    pub fn parse(heap: &HeapNode, hid: u32) -> Result<Self> {
        let hdr = heap.item(hid)?;
        if hdr.len() < 8 {
            return Err(PstError::CorruptBlock("BTH header truncated".into()));
        }
        if hdr[0] != CLIENT_SIG_BTH {
            return Err(PstError::CorruptBlock(format!(
                "bad BTH type byte {:#04x}",
                hdr[0]
            )));
        }
        let key_size = hdr[1] as usize;
        let entry_size = hdr[2] as usize;
        let levels = hdr[3];
        if !matches!(key_size, 2 | 4 | 8 | 16) || entry_size == 0 || entry_size > 32 {
            return Err(PstError::CorruptBlock(format!(
                "bad BTH geometry (key {key_size}, entry {entry_size})"
            )));
        }
        let root = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let mut records = Vec::new();
        if root != 0 {
            collect_records(heap, root, levels, key_size, entry_size, 0, &mut records)?;
        }
        Ok(Self {
            key_size,
            entry_size,
            records,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Binary search by key; returns the record's entry part.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        debug_assert_eq!(key.len(), self.key_size);
        let target = key_value(key);
        self.records
            .binary_search_by(|r| key_value(&r[..self.key_size]).cmp(&target))
            .ok()
            .map(|i| &self.records[i][self.key_size..])
    }

    pub fn records(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.records
            .iter()
            .map(|r| (&r[..self.key_size], &r[self.key_size..]))
    }
}

/// Keys are little-endian integers; fold them into a comparable value.
fn key_value(key: &[u8]) -> u128 {
    key.iter().rev().fold(0u128, |acc, &b| (acc << 8) | b as u128)
}

fn collect_records(
    heap: &HeapNode,
    hid: u32,
    level: u8,
    key_size: usize,
    entry_size: usize,
    depth: usize,
    out: &mut Vec<Vec<u8>>,
) -> Result<()> {
    if depth >= MAX_BTH_DEPTH {
        return Err(PstError::CorruptBlock("BTH deeper than allowed".into()));
    }
    let data = heap.item(hid)?;
    if level == 0 {
        let rec = key_size + entry_size;
        if data.len() % rec != 0 {
            return Err(PstError::CorruptBlock("ragged BTH leaf".into()));
        }
        for chunk in data.chunks_exact(rec) {
            out.push(chunk.to_vec());
        }
    } else {
        let rec = key_size + 4;
        if data.len() % rec != 0 {
            return Err(PstError::CorruptBlock("ragged BTH index".into()));
        }
        for chunk in data.chunks_exact(rec) {
            let child = u32::from_le_bytes(chunk[key_size..].try_into().unwrap());
            collect_records(heap, child, level - 1, key_size, entry_size, depth + 1, out)?;
        }
    }
    Ok(())
}
