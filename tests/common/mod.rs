//! Shared fixture: assembles a complete archive image in a temp file,
//! with the same page, block and heap layouts a real writer produces.

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Write};
use tempfile::NamedTempFile;

use pstrip::crc::compute_crc;
use pstrip::crypt::permute_encode;
use pstrip::page::{compute_sig, PTYPE_BBT, PTYPE_NBT};

const PAGE_SIZE: usize = 512;
const PAGE_META: usize = 488;
const PAGE_TRAILER: usize = 496;
const BLOCK_TRAILER: usize = 16;
const BLOCK_ALIGN: usize = 64;

pub const ATTACH_LEN: usize = 19_000;
pub const OVERFLOW_ROWS: usize = 500;
pub const SUBMIT_TIME_TICKS: u64 = 132_696_144_000_000_000;

fn round64(n: usize) -> usize {
    (n + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN
}

/// Heap id of the zero-based item `i` in heap block 0.
pub fn hid(i: usize) -> u32 {
    ((i + 1) as u32) << 5
}

pub fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

// ── Image builder ────────────────────────────────────────────────────────────

struct BlockRec {
    bid: u64,
    ib: u64,
    cb: u16,
}

struct NodeRec {
    nid: u32,
    bid_data: u64,
    bid_sub: u64,
    parent: u32,
}

pub struct ArchiveBuilder {
    image: Vec<u8>,
    next_bid: u64,
    blocks: Vec<BlockRec>,
    nodes: Vec<NodeRec>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            // Content starts past the header region.
            image: vec![0u8; 0x600],
            next_bid: 1,
            blocks: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn alloc_bid(&mut self, internal: bool) -> u64 {
        let bid = (self.next_bid << 2) | if internal { 0x2 } else { 0 };
        self.next_bid += 1;
        bid
    }

    fn next_offset(&mut self) -> u64 {
        let ib = round64(self.image.len());
        self.image.resize(ib, 0);
        ib as u64
    }

    /// Writes one block slot: payload (permuted when external), padding,
    /// trailer. Checksums cover the stored bytes.
    pub fn add_block(&mut self, bid: u64, payload: &[u8]) {
        let mut stored = payload.to_vec();
        if bid & 0x2 == 0 {
            permute_encode(&mut stored);
        }
        let ib = self.next_offset();
        let slot = round64(payload.len() + BLOCK_TRAILER);
        let mut buf = vec![0u8; slot];
        buf[..stored.len()].copy_from_slice(&stored);
        let mut cur = Cursor::new(&mut buf[slot - BLOCK_TRAILER..]);
        cur.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
        cur.write_u16::<LittleEndian>(compute_sig(ib, bid)).unwrap();
        cur.write_u32::<LittleEndian>(compute_crc(0, &stored)).unwrap();
        cur.write_u64::<LittleEndian>(bid).unwrap();
        self.image.extend_from_slice(&buf);
        self.blocks.push(BlockRec {
            bid,
            ib,
            cb: payload.len() as u16,
        });
    }

    pub fn add_external(&mut self, payload: &[u8]) -> u64 {
        let bid = self.alloc_bid(false);
        self.add_block(bid, payload);
        bid
    }

    pub fn add_internal(&mut self, payload: &[u8]) -> u64 {
        let bid = self.alloc_bid(true);
        self.add_block(bid, payload);
        bid
    }

    pub fn add_node(&mut self, nid: u32, bid_data: u64, bid_sub: u64, parent: u32) {
        self.nodes.push(NodeRec {
            nid,
            bid_data,
            bid_sub,
            parent,
        });
    }

    fn write_page(&mut self, entries: &[Vec<u8>], entry_size: u8, level: u8, ptype: u8) -> (u64, u64) {
        let bid = self.alloc_bid(true);
        let ib = self.next_offset();
        let mut page = vec![0u8; PAGE_SIZE];
        let mut off = 0;
        for e in entries {
            assert_eq!(e.len(), entry_size as usize);
            page[off..off + e.len()].copy_from_slice(e);
            off += e.len();
        }
        page[PAGE_META] = entries.len() as u8;
        page[PAGE_META + 1] = (PAGE_META / entry_size as usize) as u8;
        page[PAGE_META + 2] = entry_size;
        page[PAGE_META + 3] = level;
        let crc = compute_crc(0, &page[..PAGE_TRAILER]);
        let mut cur = Cursor::new(&mut page[PAGE_TRAILER..]);
        cur.write_u8(ptype).unwrap();
        cur.write_u8(ptype).unwrap();
        cur.write_u16::<LittleEndian>(compute_sig(ib, bid)).unwrap();
        cur.write_u32::<LittleEndian>(crc).unwrap();
        cur.write_u64::<LittleEndian>(bid).unwrap();
        self.image.extend_from_slice(&page);
        (bid, ib)
    }

    /// Lays out the index pages and the header, then writes the image out.
    pub fn finish(mut self) -> NamedTempFile {
        // Node B-tree: one sorted leaf page.
        let mut nodes = std::mem::take(&mut self.nodes);
        nodes.sort_by_key(|n| n.nid);
        let nbt_entries: Vec<Vec<u8>> = nodes
            .iter()
            .map(|n| {
                let mut e = Vec::with_capacity(32);
                e.extend_from_slice(&(n.nid as u64).to_le_bytes());
                e.extend_from_slice(&n.bid_data.to_le_bytes());
                e.extend_from_slice(&n.bid_sub.to_le_bytes());
                e.extend_from_slice(&n.parent.to_le_bytes());
                e.extend_from_slice(&[0u8; 4]);
                e
            })
            .collect();
        let (nbt_bid, nbt_ib) = self.write_page(&nbt_entries, 32, 0, PTYPE_NBT);

        // Block B-tree: sorted leaves under one branch page.
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.sort_by_key(|b| b.bid);
        let mut branch_entries = Vec::new();
        for chunk in blocks.chunks(20) {
            let leaf: Vec<Vec<u8>> = chunk
                .iter()
                .map(|b| {
                    let mut e = Vec::with_capacity(24);
                    e.extend_from_slice(&b.bid.to_le_bytes());
                    e.extend_from_slice(&b.ib.to_le_bytes());
                    e.extend_from_slice(&b.cb.to_le_bytes());
                    e.extend_from_slice(&1u16.to_le_bytes());
                    e.extend_from_slice(&[0u8; 4]);
                    e
                })
                .collect();
            let (leaf_bid, leaf_ib) = self.write_page(&leaf, 24, 0, PTYPE_BBT);
            let mut e = Vec::with_capacity(24);
            e.extend_from_slice(&chunk[0].bid.to_le_bytes());
            e.extend_from_slice(&leaf_bid.to_le_bytes());
            e.extend_from_slice(&leaf_ib.to_le_bytes());
            branch_entries.push(e);
        }
        let (bbt_bid, bbt_ib) = self.write_page(&branch_entries, 24, 1, PTYPE_BBT);

        let file_eof = self.image.len() as u64;
        let mut hdr = vec![0u8; 564];
        {
            let mut c = Cursor::new(&mut hdr[..]);
            c.write_u32::<LittleEndian>(0x4E44_4221).unwrap(); // "!BDN"
            c.write_u32::<LittleEndian>(0).unwrap(); // partial CRC, patched below
            c.write_u16::<LittleEndian>(0x4D53).unwrap(); // "SM"
            c.write_u16::<LittleEndian>(23).unwrap(); // unicode
            c.write_u16::<LittleEndian>(19).unwrap();
        }
        hdr[40..44].copy_from_slice(&0x1234_5678u32.to_le_bytes()); // dwUnique
        {
            let mut c = Cursor::new(&mut hdr[180..]);
            c.write_u32::<LittleEndian>(0).unwrap();
            c.write_u64::<LittleEndian>(file_eof).unwrap();
            c.write_u64::<LittleEndian>(file_eof).unwrap(); // amap last
            c.write_u64::<LittleEndian>(0).unwrap();
            c.write_u64::<LittleEndian>(0).unwrap();
            c.write_u64::<LittleEndian>(nbt_bid).unwrap();
            c.write_u64::<LittleEndian>(nbt_ib).unwrap();
            c.write_u64::<LittleEndian>(bbt_bid).unwrap();
            c.write_u64::<LittleEndian>(bbt_ib).unwrap();
            c.write_u8(1).unwrap(); // fAMapValid
        }
        hdr[512] = 0x80; // sentinel
        hdr[513] = 0x01; // permute cipher
        let partial = compute_crc(0, &hdr[8..8 + 471]);
        hdr[4..8].copy_from_slice(&partial.to_le_bytes());
        let full = compute_crc(0, &hdr[8..8 + 516]);
        hdr[524..528].copy_from_slice(&full.to_le_bytes());
        self.image[..564].copy_from_slice(&hdr);

        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(&self.image).expect("write image");
        file.flush().expect("flush image");
        file
    }
}

// ── Heap assembly ────────────────────────────────────────────────────────────

/// One heap block: header, items, allocation directory.
pub fn build_heap(client_sig: u8, user_root: u32, items: &[Vec<u8>]) -> Vec<u8> {
    let mut block = Vec::new();
    block.write_u16::<LittleEndian>(0).unwrap(); // ibHnpm, patched below
    block.write_u8(0xEC).unwrap();
    block.write_u8(client_sig).unwrap();
    block.write_u32::<LittleEndian>(user_root).unwrap();
    block.extend_from_slice(&[0u8; 4]);
    let mut offsets = vec![block.len() as u16];
    for item in items {
        block.write_all(item).unwrap();
        offsets.push(block.len() as u16);
    }
    let map_off = block.len() as u16;
    block[0..2].copy_from_slice(&map_off.to_le_bytes());
    block.write_u16::<LittleEndian>(items.len() as u16).unwrap();
    block.write_u16::<LittleEndian>(0).unwrap();
    for off in offsets {
        block.write_u16::<LittleEndian>(off).unwrap();
    }
    block
}

pub fn bth_header(key_size: u8, entry_size: u8, levels: u8, root: u32) -> Vec<u8> {
    let mut item = vec![0xB5, key_size, entry_size, levels];
    item.extend_from_slice(&root.to_le_bytes());
    item
}

/// Property context heap: item 0 is the property tree header, item 1 its
/// leaf, values follow from item 2 onward (so the first value is `hid(2)`).
pub fn build_pc(records: &[(u16, u16, u32)], values: &[Vec<u8>]) -> Vec<u8> {
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0), "records sorted");
    let mut leaf = Vec::new();
    for &(id, ptype, dword) in records {
        leaf.extend_from_slice(&id.to_le_bytes());
        leaf.extend_from_slice(&ptype.to_le_bytes());
        leaf.extend_from_slice(&dword.to_le_bytes());
    }
    let mut items = vec![bth_header(2, 6, 0, if records.is_empty() { 0 } else { hid(1) }), leaf];
    items.extend(values.iter().cloned());
    build_heap(0xBC, hid(0), &items)
}

/// TCINFO item: column group ends, row index and row storage references,
/// then the column descriptors.
pub fn tcinfo(cols: &[(u32, u16, u8, u8)], rgib: [u16; 4], hid_row_index: u32, hnid_rows: u32) -> Vec<u8> {
    let mut item = vec![0x7C, cols.len() as u8];
    for end in rgib {
        item.extend_from_slice(&end.to_le_bytes());
    }
    item.extend_from_slice(&hid_row_index.to_le_bytes());
    item.extend_from_slice(&hnid_rows.to_le_bytes());
    item.extend_from_slice(&0u32.to_le_bytes()); // deprecated index
    for &(tag, off, size, bit) in cols {
        item.extend_from_slice(&tag.to_le_bytes());
        item.extend_from_slice(&off.to_le_bytes());
        item.push(size);
        item.push(bit);
    }
    item
}

/// Row-index records (row id -> position), sorted by id as stored on disk.
pub fn row_index_records(row_ids: &[u32]) -> Vec<u8> {
    let mut pairs: Vec<(u32, u32)> = row_ids
        .iter()
        .enumerate()
        .map(|(pos, &id)| (id, pos as u32))
        .collect();
    pairs.sort_by_key(|&(id, _)| id);
    let mut out = Vec::with_capacity(pairs.len() * 8);
    for (id, pos) in pairs {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&pos.to_le_bytes());
    }
    out
}

/// XBLOCK payload pointing at `bids`, declaring `total` data bytes.
pub fn xblock(bids: &[u64], total: u32) -> Vec<u8> {
    let mut out = vec![0x01, 0x01];
    out.extend_from_slice(&(bids.len() as u16).to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    for bid in bids {
        out.extend_from_slice(&bid.to_le_bytes());
    }
    out
}

/// Sub-node leaf payload: (nid, data bid, sub bid) triples.
pub fn sub_node_leaf(entries: &[(u32, u64, u64)]) -> Vec<u8> {
    let mut out = vec![0x02, 0x00];
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    for &(nid, bid_data, bid_sub) in entries {
        out.extend_from_slice(&(nid as u64).to_le_bytes());
        out.extend_from_slice(&bid_data.to_le_bytes());
        out.extend_from_slice(&bid_sub.to_le_bytes());
    }
    out
}

// ── Sample archive ───────────────────────────────────────────────────────────

pub fn attach_payload() -> Vec<u8> {
    (0..ATTACH_LEN).map(|i| (i % 251) as u8).collect()
}

pub fn overflow_row_id(i: usize) -> u32 {
    (((1000 + i) as u32) << 5) | 0x04
}

const TAG_ROW_ID: u32 = 0x67F2_0003;
const TAG_ROW_VER: u32 = 0x67F3_0003;
const TAG_MESSAGE_SIZE: u32 = 0x0E08_0003;
const TAG_SUBJECT: u32 = 0x0037_001F;
const TAG_DISPLAY_NAME: u32 = 0x3001_001F;

/// Contents/hierarchy table layout: a row id and one string column.
fn narrow_cols(string_tag: u32) -> Vec<(u32, u16, u8, u8)> {
    vec![(TAG_ROW_ID, 0, 4, 0), (string_tag, 4, 4, 1)]
}

fn narrow_row(row_id: u32, string_hid: u32) -> Vec<u8> {
    let mut row = Vec::with_capacity(9);
    row.extend_from_slice(&row_id.to_le_bytes());
    row.extend_from_slice(&string_hid.to_le_bytes());
    row.push(0xC0);
    row
}

/// Builds the full sample archive:
///
/// - message store and a root folder with one sub-folder ("Inbox")
/// - two messages in the Inbox, one carrying a 19 000 byte attachment
///   spread over three data blocks
/// - a standalone 500-row table split over two row blocks, with a
///   two-level row index
/// - a folder that claims children without the tables to back them
/// - a node whose block tree points at itself
/// - a property context whose string points past the heap directory
pub fn build_sample_archive() -> NamedTempFile {
    let mut b = ArchiveBuilder::new();

    // Message store.
    let store = b.add_external(&build_pc(
        &[(0x3001, 0x001F, hid(2))],
        &[utf16("Personal Folders")],
    ));
    b.add_node(0x21, store, 0, 0);

    // Root folder.
    let root_pc = b.add_external(&build_pc(
        &[
            (0x3001, 0x001F, hid(2)),
            (0x3602, 0x0003, 0),
            (0x360A, 0x000B, 1),
        ],
        &[utf16("Top of Personal Folders")],
    ));
    b.add_node(0x122, root_pc, 0, 0);

    // Root hierarchy: one child folder row.
    let root_hier = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[
            tcinfo(&narrow_cols(TAG_DISPLAY_NAME), [8, 8, 8, 9], hid(1), hid(3)),
            bth_header(4, 4, 0, hid(2)),
            row_index_records(&[0x402]),
            narrow_row(0x402, hid(4)),
            utf16("Inbox"),
        ],
    ));
    b.add_node(0x12D, root_hier, 0, 0x122);

    // Root contents: present but empty.
    let root_cont = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[tcinfo(&narrow_cols(TAG_SUBJECT), [8, 8, 8, 9], 0, 0)],
    ));
    b.add_node(0x12E, root_cont, 0, 0x122);

    // Inbox.
    let inbox_pc = b.add_external(&build_pc(
        &[
            (0x3001, 0x001F, hid(2)),
            (0x3602, 0x0003, 2),
            (0x360A, 0x000B, 0),
        ],
        &[utf16("Inbox")],
    ));
    b.add_node(0x402, inbox_pc, 0, 0x122);

    let inbox_hier = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[tcinfo(&narrow_cols(TAG_DISPLAY_NAME), [8, 8, 8, 9], 0, 0)],
    ));
    b.add_node(0x40D, inbox_hier, 0, 0x402);

    let inbox_cont = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[
            tcinfo(&narrow_cols(TAG_SUBJECT), [8, 8, 8, 9], hid(1), hid(3)),
            bth_header(4, 4, 0, hid(2)),
            row_index_records(&[0x504, 0x524]),
            [narrow_row(0x504, hid(4)), narrow_row(0x524, hid(5))].concat(),
            utf16("Quarterly report"),
            utf16("Lunch?"),
        ],
    ));
    b.add_node(0x40E, inbox_cont, 0, 0x402);

    // First message: full property set plus one attachment.
    let payload = attach_payload();
    let d1 = b.add_external(&payload[..8176]);
    let d2 = b.add_external(&payload[8176..16352]);
    let d3 = b.add_external(&payload[16352..]);
    let attach_tree = b.add_internal(&xblock(&[d1, d2, d3], ATTACH_LEN as u32));
    let attach_sub = b.add_internal(&sub_node_leaf(&[(0x8025, attach_tree, 0)]));
    let attach_pc = b.add_external(&build_pc(
        &[
            (0x0E20, 0x0003, 19_230),
            (0x3701, 0x0102, 0x8025),
            (0x3705, 0x0003, 1),
            (0x3707, 0x001F, hid(2)),
        ],
        &[utf16("report.xlsx")],
    ));
    let attach_table = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[
            tcinfo(
                &[(TAG_ROW_ID, 0, 4, 0), (0x0E20_0003, 4, 4, 1)],
                [8, 8, 8, 9],
                hid(1),
                hid(3),
            ),
            bth_header(4, 4, 0, hid(2)),
            row_index_records(&[0x665]),
            {
                let mut row = Vec::new();
                row.extend_from_slice(&0x665u32.to_le_bytes());
                row.extend_from_slice(&19_230u32.to_le_bytes());
                row.push(0xC0);
                row
            },
        ],
    ));
    let recip_table = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[
            tcinfo(&narrow_cols(TAG_DISPLAY_NAME), [8, 8, 8, 9], hid(1), hid(3)),
            bth_header(4, 4, 0, hid(2)),
            row_index_records(&[0x30]),
            narrow_row(0x30, hid(4)),
            utf16("Bob Drake"),
        ],
    ));
    let msg1_sub = b.add_internal(&sub_node_leaf(&[
        (0x665, attach_pc, attach_sub),
        (0x671, attach_table, 0),
        (0x692, recip_table, 0),
    ]));
    let msg1_pc = b.add_external(&build_pc(
        &[
            (0x001A, 0x001F, hid(2)),
            (0x0037, 0x001F, hid(3)),
            (0x0039, 0x0040, hid(4)),
            (0x0C1A, 0x001F, hid(5)),
            (0x0C1F, 0x001F, hid(6)),
            (0x0E04, 0x001F, hid(7)),
            (0x1000, 0x001F, hid(8)),
        ],
        &[
            utf16("IPM.Note"),
            utf16("Quarterly report"),
            SUBMIT_TIME_TICKS.to_le_bytes().to_vec(),
            utf16("Alice Chen"),
            utf16("alice@example.com"),
            utf16("Bob Drake"),
            utf16("Please find the numbers attached."),
        ],
    ));
    b.add_node(0x504, msg1_pc, msg1_sub, 0x402);

    // Second message: minimal.
    let msg2_pc = b.add_external(&build_pc(
        &[(0x0037, 0x001F, hid(2)), (0x0C1A, 0x001F, hid(3))],
        &[utf16("Lunch?"), utf16("Bob Drake")],
    ));
    b.add_node(0x524, msg2_pc, 0, 0x402);

    // A folder whose properties promise children its tables do not back.
    let orphan_pc = b.add_external(&build_pc(
        &[
            (0x3001, 0x001F, hid(2)),
            (0x3602, 0x0003, 3),
            (0x360A, 0x000B, 1),
        ],
        &[utf16("Drafts")],
    ));
    b.add_node(0x602, orphan_pc, 0, 0x122);

    // Standalone 500-row table: 17-byte rows, 480 per block.
    let mut all_rows = Vec::new();
    for i in 0..OVERFLOW_ROWS {
        all_rows.extend_from_slice(&overflow_row_id(i).to_le_bytes());
        all_rows.extend_from_slice(&(i as u32).to_le_bytes());
        all_rows.extend_from_slice(&((100 + 3 * i) as u32).to_le_bytes());
        all_rows.extend_from_slice(&0u32.to_le_bytes()); // subject slot, bit clear
        all_rows.push(0xE0);
    }
    let r1 = b.add_external(&all_rows[..480 * 17]);
    let r2 = b.add_external(&all_rows[480 * 17..]);
    let row_tree = b.add_internal(&xblock(&[r1, r2], all_rows.len() as u32));
    let row_sub = b.add_internal(&sub_node_leaf(&[(0x8401, row_tree, 0)]));
    let all_recs = row_index_records(&(0..OVERFLOW_ROWS).map(overflow_row_id).collect::<Vec<_>>());
    let mut index_item = Vec::new();
    index_item.extend_from_slice(&overflow_row_id(0).to_le_bytes());
    index_item.extend_from_slice(&hid(3).to_le_bytes());
    index_item.extend_from_slice(&overflow_row_id(250).to_le_bytes());
    index_item.extend_from_slice(&hid(4).to_le_bytes());
    let big_table = b.add_external(&build_heap(
        0x7C,
        hid(0),
        &[
            tcinfo(
                &[
                    (TAG_ROW_ID, 0, 4, 0),
                    (TAG_ROW_VER, 4, 4, 1),
                    (TAG_MESSAGE_SIZE, 8, 4, 2),
                    (TAG_SUBJECT, 12, 4, 3),
                ],
                [16, 16, 16, 17],
                hid(1),
                0x8401,
            ),
            bth_header(4, 4, 1, hid(2)),
            index_item,
            all_recs[..250 * 8].to_vec(),
            all_recs[250 * 8..].to_vec(),
        ],
    ));
    b.add_node(0x190E, big_table, row_sub, 0);

    // A block tree that points back at itself.
    let cyclic = b.alloc_bid(true);
    b.add_block(cyclic, &xblock(&[cyclic], 0));
    b.add_node(0x259F, cyclic, 0, 0);

    // A property whose heap id points past the item directory.
    let bad_pc = b.add_external(&build_pc(
        &[(0x3001, 0x001F, hid(9))],
        &[utf16("x")],
    ));
    b.add_node(0x25A2, bad_pc, 0, 0);

    b.finish()
}
