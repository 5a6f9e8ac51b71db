//! Node Index: the two parallel B-trees mapping node ids to descriptor
//! records and block ids to physical block records.
//!
//! Pages are read on demand through the block reader, never loaded
//! wholesale; each descent does an ordered binary search per page.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use log::trace;

use crate::block::BlockReader;
use crate::error::{PstError, Result};
use crate::header::{Bref, FormatKind, Header};
use crate::page::{BtPage, PTYPE_BBT, PTYPE_NBT};

// ── Node ids ─────────────────────────────────────────────────────────────────

pub const NID_TYPE_HID: u8 = 0x00;
pub const NID_TYPE_INTERNAL: u8 = 0x01;
pub const NID_TYPE_NORMAL_FOLDER: u8 = 0x02;
pub const NID_TYPE_SEARCH_FOLDER: u8 = 0x03;
pub const NID_TYPE_NORMAL_MESSAGE: u8 = 0x04;
pub const NID_TYPE_ATTACHMENT: u8 = 0x05;
pub const NID_TYPE_HIERARCHY_TABLE: u8 = 0x0D;
pub const NID_TYPE_CONTENTS_TABLE: u8 = 0x0E;
pub const NID_TYPE_ASSOC_CONTENTS_TABLE: u8 = 0x0F;
pub const NID_TYPE_ATTACHMENT_TABLE: u8 = 0x11;
pub const NID_TYPE_RECIPIENT_TABLE: u8 = 0x12;

/// Fixed well-known nodes.
pub const NID_MESSAGE_STORE: u32 = 0x21;
pub const NID_ROOT_FOLDER: u32 = 0x122;

/// Fixed sub-node ids inside a message.
pub const NID_ATTACHMENT_TABLE: u32 = 0x671;
pub const NID_RECIPIENT_TABLE: u32 = 0x692;

/// The low five bits of a node id carry its type.
pub fn nid_type(nid: u32) -> u8 {
    (nid & 0x1F) as u8
}

pub fn nid_index(nid: u32) -> u32 {
    nid >> 5
}

pub fn make_nid(nid_type: u8, index: u32) -> u32 {
    (index << 5) | nid_type as u32
}

// ── Records ──────────────────────────────────────────────────────────────────

/// Leaf record of the node B-tree: where a node's data lives.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub nid: u32,
    pub bid_data: u64,
    /// Root of the node's sub-node tree, or zero.
    pub bid_sub: u64,
    pub parent_nid: u32,
}

/// Leaf record of the block B-tree: where a block's bytes live.
#[derive(Debug, Clone, Copy)]
pub struct BlockEntry {
    pub bref: Bref,
    pub size: u16,
    pub refs: u16,
}

// ── NodeIndex ────────────────────────────────────────────────────────────────

/// The format caps B-tree height well below this; a descent that has not
/// reached a leaf by then is walking corrupted pages.
const MAX_DEPTH: usize = 8;

pub struct NodeIndex {
    nbt: Bref,
    bbt: Bref,
    kind: FormatKind,
}

impl NodeIndex {
    pub fn new(header: &Header) -> Self {
        Self {
            nbt: header.root.nbt,
            bbt: header.root.bbt,
            kind: header.kind,
        }
    }

    pub fn lookup(&self, reader: &BlockReader, nid: u32) -> Result<NodeEntry> {
        match self.descend(reader, self.nbt, PTYPE_NBT, nid as u64)? {
            Some(raw) => parse_node_entry(&raw, self.kind),
            None => Err(PstError::NotFound(format!("node {nid:#x}"))),
        }
    }

    pub fn lookup_block(&self, reader: &BlockReader, bid: u64) -> Result<BlockEntry> {
        match self.descend(reader, self.bbt, PTYPE_BBT, bid)? {
            Some(raw) => parse_block_entry(&raw, self.kind),
            None => Err(PstError::NotFound(format!("block {bid:#x}"))),
        }
    }

    fn descend(
        &self,
        reader: &BlockReader,
        root: Bref,
        ptype: u8,
        key: u64,
    ) -> Result<Option<Vec<u8>>> {
        let mut bref = root;
        for depth in 0..MAX_DEPTH {
            let raw = reader.read_page(bref.ib)?;
            let page = BtPage::parse(&raw, bref.ib, self.kind)?;
            if page.ptype != ptype {
                return Err(PstError::CorruptBlock(format!(
                    "page {:#x} belongs to the wrong B-tree",
                    bref.ib
                )));
            }
            if page.bid != bref.bid {
                return Err(PstError::CorruptBlock(format!(
                    "page identity mismatch at {:#x}",
                    bref.ib
                )));
            }
            trace!(
                "btree descent key={key:#x} depth={depth} level={} entries={}",
                page.level,
                page.entry_count
            );
            if page.level == 0 {
                return Ok(self.leaf_entry(&page, key));
            }
            match self.branch_child(&page, key)? {
                Some(child) => bref = child,
                None => return Ok(None),
            }
        }
        Err(PstError::CorruptBlock(
            "B-tree deeper than the format allows".into(),
        ))
    }

    fn key_at(&self, page: &BtPage, i: usize) -> u64 {
        let e = page.entry(i);
        if self.kind.is_wide() {
            u64::from_le_bytes(e[..8].try_into().unwrap())
        } else {
            u32::from_le_bytes(e[..4].try_into().unwrap()) as u64
        }
    }

    /// Largest entry whose key is `<=` the target, or `None` when the key
    /// sorts before the whole page.
    fn branch_child(&self, page: &BtPage, key: u64) -> Result<Option<Bref>> {
        let mut lo = 0;
        let mut hi = page.entry_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(page, mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        let e = page.entry(lo - 1);
        let key_size = if self.kind.is_wide() { 8 } else { 4 };
        let bref = Bref::read(Cursor::new(&e[key_size..]), self.kind)?;
        Ok(Some(bref))
    }

    fn leaf_entry(&self, page: &BtPage, key: u64) -> Option<Vec<u8>> {
        let mut lo = 0;
        let mut hi = page.entry_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key_at(page, mid).cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(page.entry(mid).to_vec()),
            }
        }
        None
    }
}

fn parse_node_entry(raw: &[u8], kind: FormatKind) -> Result<NodeEntry> {
    let mut cur = Cursor::new(raw);
    if kind.is_wide() {
        // The node id is stored widened to 64 bits; only the low half is
        // meaningful.
        let nid = cur.read_u64::<LittleEndian>()? as u32;
        let bid_data = cur.read_u64::<LittleEndian>()?;
        let bid_sub = cur.read_u64::<LittleEndian>()?;
        let parent_nid = cur.read_u32::<LittleEndian>()?;
        Ok(NodeEntry { nid, bid_data, bid_sub, parent_nid })
    } else {
        let nid = cur.read_u32::<LittleEndian>()?;
        let bid_data = cur.read_u32::<LittleEndian>()? as u64;
        let bid_sub = cur.read_u32::<LittleEndian>()? as u64;
        let parent_nid = cur.read_u32::<LittleEndian>()?;
        Ok(NodeEntry { nid, bid_data, bid_sub, parent_nid })
    }
}

fn parse_block_entry(raw: &[u8], kind: FormatKind) -> Result<BlockEntry> {
    let mut cur = Cursor::new(raw);
    let bref = Bref::read(&mut cur, kind)?;
    let size = cur.read_u16::<LittleEndian>()?;
    let refs = cur.read_u16::<LittleEndian>()?;
    Ok(BlockEntry { bref, size, refs })
}
