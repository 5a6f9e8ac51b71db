//! Fixed-size index pages and their trailers.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::crc::compute_crc;
use crate::error::{PstError, Result};
use crate::header::FormatKind;

pub const PTYPE_BBT: u8 = 0x80;
pub const PTYPE_NBT: u8 = 0x81;

/// Page/block signature: folds the byte offset and block id into 16 bits.
pub fn compute_sig(ib: u64, bid: u64) -> u16 {
    let x = ib ^ bid;
    ((x >> 16) as u16) ^ (x as u16)
}

// ── PageTrailer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PageTrailer {
    pub ptype: u8,
    pub sig: u16,
    pub crc: u32,
    pub bid: u64,
}

impl PageTrailer {
    /// Parses the trailer from the tail of a full page buffer. The two
    /// field orders differ between the 32-bit and 64-bit encodings.
    pub fn parse(page: &[u8], kind: FormatKind) -> Result<Self> {
        let tsize = kind.page_trailer_size();
        if page.len() < tsize {
            return Err(PstError::CorruptBlock("page shorter than its trailer".into()));
        }
        let mut cur = Cursor::new(&page[page.len() - tsize..]);
        let ptype = cur.read_u8()?;
        let ptype_repeat = cur.read_u8()?;
        if ptype != ptype_repeat {
            return Err(PstError::CorruptBlock(format!(
                "page type bytes disagree ({ptype:#04x} vs {ptype_repeat:#04x})"
            )));
        }
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
        Ok(Self { ptype, sig, crc, bid })
    }
}

// ── BtPage ───────────────────────────────────────────────────────────────────

/// One B-tree page, validated and reduced to its raw entry array. Entry
/// decoding is left to the index layer, which knows whether this is a
/// branch or a leaf of which tree.
#[derive(Debug, Clone)]
pub struct BtPage {
    pub ptype: u8,
    pub level: u8,
    pub entry_count: usize,
    pub entry_size: usize,
    pub entries: Vec<u8>,
    pub bid: u64,
}

impl BtPage {
    pub fn parse(page: &[u8], ib: u64, kind: FormatKind) -> Result<Self> {
        if page.len() != kind.page_size() {
            return Err(PstError::CorruptBlock("short page read".into()));
        }
        let trailer = PageTrailer::parse(page, kind)?;
        if trailer.ptype != PTYPE_BBT && trailer.ptype != PTYPE_NBT {
            return Err(PstError::CorruptBlock(format!(
                "unexpected page type {:#04x}",
                trailer.ptype
            )));
        }
        let body_len = page.len() - kind.page_trailer_size();
        if compute_crc(0, &page[..body_len]) != trailer.crc {
            return Err(PstError::CorruptBlock("page CRC mismatch".into()));
        }
        if compute_sig(ib, trailer.bid) != trailer.sig {
            return Err(PstError::CorruptBlock("page signature mismatch".into()));
        }

        // Entry metadata sits just before the trailer; the wide layout pads
        // it to eight bytes.
        let meta = if kind.is_wide() { body_len - 8 } else { body_len - 4 };
        let entry_count = page[meta] as usize;
        let entry_max = page[meta + 1] as usize;
        let entry_size = page[meta + 2] as usize;
        let level = page[meta + 3];
        if entry_size == 0 || entry_count > entry_max || entry_count * entry_size > meta {
            return Err(PstError::CorruptBlock("bad B-tree page geometry".into()));
        }

        Ok(Self {
            ptype: trailer.ptype,
            level,
            entry_count,
            entry_size,
            entries: page[..entry_count * entry_size].to_vec(),
            bid: trailer.bid,
        })
    }

    pub fn entry(&self, i: usize) -> &[u8] {
        &self.entries[i * self.entry_size..(i + 1) * self.entry_size]
    }
}
