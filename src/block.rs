//! Block Reader: maps block ids to decrypted, checksum-validated byte
//! content, and resolves internal pointer-table blocks transitively until
//! external data is reached.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

use log::debug;

use crate::crc::compute_crc;
use crate::crypt::{self, CryptMethod};
use crate::error::{PstError, Result};
use crate::header::{FormatKind, Header};
use crate::index::{BlockEntry, NodeEntry, NodeIndex};
use crate::page::compute_sig;

/// Bit marking a block as an internal pointer table rather than external
/// node data.
pub const BID_INTERNAL: u64 = 0x2;

/// Block slots are padded to this granularity, trailer included.
pub const BLOCK_ALIGN: usize = 64;

/// An XBLOCK can point at an XXBLOCK can point at data; anything deeper
/// is not a well-formed tree.
const MAX_TREE_DEPTH: usize = 4;

pub fn bid_is_internal(bid: u64) -> bool {
    bid & BID_INTERNAL != 0
}

/// On-disk footprint of a block carrying `cb` payload bytes.
pub fn slot_size(cb: usize, kind: FormatKind) -> usize {
    let raw = cb + kind.block_trailer_size();
    (raw + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN
}

// ── BlockTrailer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BlockTrailer {
    pub cb: u16,
    pub sig: u16,
    pub crc: u32,
    pub bid: u64,
}

impl BlockTrailer {
    /// Parses the trailer from the last bytes of a block slot.
    pub fn parse(slot: &[u8], kind: FormatKind) -> Result<Self> {
        let tsize = kind.block_trailer_size();
        if slot.len() < tsize {
            return Err(PstError::CorruptBlock("slot shorter than its trailer".into()));
        }
        let mut cur = Cursor::new(&slot[slot.len() - tsize..]);
        let cb = cur.read_u16::<LittleEndian>()?;
        let sig = cur.read_u16::<LittleEndian>()?;
        let (crc, bid) = if kind.is_wide() {
            let crc = cur.read_u32::<LittleEndian>()?;
            let bid = cur.read_u64::<LittleEndian>()?;
            (crc, bid)
        } else {
            let bid = cur.read_u32::<LittleEndian>()? as u64;
            let crc = cur.read_u32::<LittleEndian>()?;
            (crc, bid)
        };
        Ok(Self { cb, sig, crc, bid })
    }
}

// ── Internal block layouts ───────────────────────────────────────────────────

/// Parsed XBLOCK/XXBLOCK: an ordered list of child block ids plus the
/// total byte count of the data they lead to.
#[derive(Debug)]
struct TreeBlock {
    total: u64,
    bids: Vec<u64>,
}

fn parse_tree_block(data: &[u8], kind: FormatKind) -> Result<TreeBlock> {
    let mut cur = Cursor::new(data);
    let btype = cur.read_u8()?;
    let level = cur.read_u8()?;
    if btype != 0x01 || !(1..=2).contains(&level) {
        return Err(PstError::CorruptBlock(format!(
            "not a data-tree block (type {btype:#04x}, level {level})"
        )));
    }
    let count = cur.read_u16::<LittleEndian>()? as usize;
    let total = cur.read_u32::<LittleEndian>()? as u64;
    let mut bids = Vec::with_capacity(count);
    for _ in 0..count {
        bids.push(if kind.is_wide() {
            cur.read_u64::<LittleEndian>()?
        } else {
            cur.read_u32::<LittleEndian>()? as u64
        });
    }
    Ok(TreeBlock { total, bids })
}

/// Sub-node entry: a node hosted inside another node's block tree.
#[derive(Debug, Clone, Copy)]
pub struct SubNodeEntry {
    pub nid: u32,
    pub bid_data: u64,
    pub bid_sub: u64,
}

enum SubNodeBlock {
    Leaf(Vec<SubNodeEntry>),
    Branch(Vec<u64>),
}

fn parse_sub_node_block(data: &[u8], kind: FormatKind) -> Result<SubNodeBlock> {
    let mut cur = Cursor::new(data);
    let btype = cur.read_u8()?;
    let level = cur.read_u8()?;
    if btype != 0x02 {
        return Err(PstError::CorruptBlock(format!(
            "not a sub-node block (type {btype:#04x})"
        )));
    }
    let count = cur.read_u16::<LittleEndian>()? as usize;
    if kind.is_wide() {
        let _padding = cur.read_u32::<LittleEndian>()?;
    }
    fn read_id(cur: &mut Cursor<&[u8]>, kind: FormatKind) -> std::io::Result<u64> {
        if kind.is_wide() {
            cur.read_u64::<LittleEndian>()
        } else {
            Ok(cur.read_u32::<LittleEndian>()? as u64)
        }
    }
    match level {
        0 => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let nid = read_id(&mut cur, kind)? as u32;
                let bid_data = read_id(&mut cur, kind)?;
                let bid_sub = read_id(&mut cur, kind)?;
                entries.push(SubNodeEntry { nid, bid_data, bid_sub });
            }
            Ok(SubNodeBlock::Leaf(entries))
        }
        1 => {
            let mut bids = Vec::with_capacity(count);
            for _ in 0..count {
                let _nid = read_id(&mut cur, kind)?;
                bids.push(read_id(&mut cur, kind)?);
            }
            Ok(SubNodeBlock::Branch(bids))
        }
        _ => Err(PstError::CorruptBlock(format!(
            "bad sub-node block level {level}"
        ))),
    }
}

// ── BlockReader ──────────────────────────────────────────────────────────────

/// Owns the archive file and serves decoded blocks. Every read is a
/// self-contained positioned read; the file handle is the only shared
/// state, so the reader stays single-threaded by design.
pub struct BlockReader {
    file: RefCell<File>,
    kind: FormatKind,
    crypt: CryptMethod,
    index: NodeIndex,
}

impl BlockReader {
    pub fn new(file: File, header: &Header) -> Self {
        Self {
            file: RefCell::new(file),
            kind: header.kind,
            crypt: header.crypt,
            index: NodeIndex::new(header),
        }
    }

    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    pub fn crypt(&self) -> CryptMethod {
        self.crypt
    }

    fn read_raw(&self, ib: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(ib))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PstError::CorruptBlock(format!("address {ib:#x}+{len} past end of file"))
            } else {
                PstError::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Reads one raw index page at an absolute offset.
    pub fn read_page(&self, ib: u64) -> Result<Vec<u8>> {
        self.read_raw(ib, self.kind.page_size())
    }

    pub fn lookup_node(&self, nid: u32) -> Result<NodeEntry> {
        self.index.lookup(self, nid)
    }

    pub fn lookup_block(&self, bid: u64) -> Result<BlockEntry> {
        self.index.lookup_block(self, bid)
    }

    /// Returns one block's validated content, decrypted when the block
    /// carries external data. Internal pointer tables are stored in the
    /// clear.
    pub fn read_block(&self, bid: u64) -> Result<Vec<u8>> {
        let entry = self.lookup_block(bid)?;
        let cb = entry.size as usize;
        if cb > self.kind.max_block_data() {
            return Err(PstError::CorruptBlock(format!(
                "block {bid:#x} claims {cb} bytes"
            )));
        }
        let slot = slot_size(cb, self.kind);
        let raw = self.read_raw(entry.bref.ib, slot)?;
        let trailer = BlockTrailer::parse(&raw, self.kind)?;
        if trailer.cb as usize != cb || trailer.bid != bid {
            return Err(PstError::CorruptBlock(format!(
                "block {bid:#x} trailer disagrees with its index record"
            )));
        }
        if trailer.sig != compute_sig(entry.bref.ib, bid) {
            return Err(PstError::CorruptBlock(format!(
                "block {bid:#x} signature mismatch"
            )));
        }
        if trailer.crc != compute_crc(0, &raw[..cb]) {
            return Err(PstError::CorruptBlock(format!(
                "block {bid:#x} checksum mismatch"
            )));
        }
        let mut data = raw[..cb].to_vec();
        if !bid_is_internal(bid) {
            match self.crypt {
                CryptMethod::None => {}
                CryptMethod::Permute => crypt::permute_decode(&mut data),
                CryptMethod::Cyclic => crypt::cyclic_decode(&mut data, bid as u32),
            }
        }
        Ok(data)
    }

    /// Resolves a possibly-internal block id down to the ordered list of
    /// external data blocks it leads to.
    pub fn read_data_tree(&self, bid: u64) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        self.walk_data_tree(bid, 0, &mut visited, &mut out)?;
        Ok(out)
    }

    fn walk_data_tree(
        &self,
        bid: u64,
        depth: usize,
        visited: &mut HashSet<u64>,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if depth >= MAX_TREE_DEPTH {
            return Err(PstError::CorruptBlock(
                "block tree exceeds the maximum depth".into(),
            ));
        }
        if !visited.insert(bid) {
            return Err(PstError::CorruptBlock(format!(
                "cyclic block reference at {bid:#x}"
            )));
        }
        if !bid_is_internal(bid) {
            out.push(self.read_block(bid)?);
            return Ok(());
        }
        let data = self.read_block(bid)?;
        let tree = parse_tree_block(&data, self.kind)?;
        for child in tree.bids {
            self.walk_data_tree(child, depth + 1, visited, out)?;
        }
        Ok(())
    }

    /// Like [`read_data_tree`](Self::read_data_tree) but stops at the leaf
    /// block ids without fetching their payloads, for callers that want to
    /// stream. Returns the ids plus the total byte count.
    pub fn data_tree_layout(&self, bid: u64) -> Result<(Vec<u64>, u64)> {
        let mut bids = Vec::new();
        let mut visited = HashSet::new();
        let total = self.walk_layout(bid, 0, &mut visited, &mut bids)?;
        Ok((bids, total))
    }

    fn walk_layout(
        &self,
        bid: u64,
        depth: usize,
        visited: &mut HashSet<u64>,
        bids: &mut Vec<u64>,
    ) -> Result<u64> {
        if depth >= MAX_TREE_DEPTH {
            return Err(PstError::CorruptBlock(
                "block tree exceeds the maximum depth".into(),
            ));
        }
        if !visited.insert(bid) {
            return Err(PstError::CorruptBlock(format!(
                "cyclic block reference at {bid:#x}"
            )));
        }
        if !bid_is_internal(bid) {
            let entry = self.lookup_block(bid)?;
            bids.push(bid);
            return Ok(entry.size as u64);
        }
        let data = self.read_block(bid)?;
        let tree = parse_tree_block(&data, self.kind)?;
        let mut total = 0u64;
        for child in tree.bids {
            total += self.walk_layout(child, depth + 1, visited, bids)?;
        }
        if tree.total != 0 && tree.total != total {
            debug!(
                "data tree {bid:#x} declares {} bytes but leaves carry {total}",
                tree.total
            );
        }
        Ok(total)
    }

    /// Concatenated external data for a node's block tree.
    pub fn read_node_data(&self, bid: u64) -> Result<Vec<u8>> {
        let blocks = self.read_data_tree(bid)?;
        let total = blocks.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for b in blocks {
            out.extend_from_slice(&b);
        }
        Ok(out)
    }

    /// Flattens a sub-node tree into an id-ordered map.
    pub fn sub_node_map(&self, bid_sub: u64) -> Result<BTreeMap<u32, SubNodeEntry>> {
        let mut map = BTreeMap::new();
        if bid_sub == 0 {
            return Ok(map);
        }
        let mut visited = HashSet::new();
        self.walk_sub_nodes(bid_sub, 0, &mut visited, &mut map)?;
        Ok(map)
    }

    fn walk_sub_nodes(
        &self,
        bid: u64,
        depth: usize,
        visited: &mut HashSet<u64>,
        map: &mut BTreeMap<u32, SubNodeEntry>,
    ) -> Result<()> {
        if depth >= MAX_TREE_DEPTH {
            return Err(PstError::CorruptBlock(
                "sub-node tree exceeds the maximum depth".into(),
            ));
        }
        if !visited.insert(bid) {
            return Err(PstError::CorruptBlock(format!(
                "cyclic sub-node reference at {bid:#x}"
            )));
        }
        let data = self.read_block(bid)?;
        match parse_sub_node_block(&data, self.kind)? {
            SubNodeBlock::Leaf(entries) => {
                for e in entries {
                    map.insert(e.nid, e);
                }
            }
            SubNodeBlock::Branch(bids) => {
                for child in bids {
                    self.walk_sub_nodes(child, depth + 1, visited, map)?;
                }
            }
        }
        Ok(())
    }

    /// Looks up one entry of a node's sub-node tree. `Ok(None)` when the
    /// tree exists but has no such id.
    pub fn sub_node_entry(&self, bid_sub: u64, nid: u32) -> Result<Option<SubNodeEntry>> {
        if bid_sub == 0 {
            return Ok(None);
        }
        Ok(self.sub_node_map(bid_sub)?.get(&nid).copied())
    }
}
