//! Archive header: magic, version, CRC regions and the ROOT record that
//! anchors the two B-trees.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Cursor, Read};

use crate::crc::compute_crc;
use crate::crypt::CryptMethod;
use crate::error::{PstError, Result};

pub const MAGIC: u32 = 0x4E44_4221; // "!BDN"
pub const MAGIC_CLIENT: u16 = 0x4D53; // "SM"
pub const VER_CLIENT: u16 = 19;
pub const SENTINEL: u8 = 0x80;

/// Total header size on disk.
pub const HEADER_SIZE_ANSI: usize = 512;
pub const HEADER_SIZE_WIDE: usize = 564;

// Both variants checksum 471 bytes starting at wMagicClient; the wide
// variant adds a second CRC over the full 516-byte region.
const CRC_START: usize = 8;
const CRC_PARTIAL_LEN: usize = 471;
const CRC_FULL_LEN: usize = 516;

// ── FormatKind ───────────────────────────────────────────────────────────────

/// Addressing variant, selected once from the header version and fixed for
/// the archive's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// Legacy 32-bit ids and offsets.
    Ansi,
    /// 64-bit ids and offsets, 512-byte pages.
    Unicode,
    /// 64-bit variant with 4 KiB pages.
    Unicode4k,
}

impl FormatKind {
    pub fn from_version(ver: u16) -> Option<Self> {
        match ver {
            14 | 15 => Some(FormatKind::Ansi),
            23 => Some(FormatKind::Unicode),
            36 => Some(FormatKind::Unicode4k),
            _ => None,
        }
    }

    /// True for the 64-bit encodings.
    pub fn is_wide(self) -> bool {
        !matches!(self, FormatKind::Ansi)
    }

    pub fn page_size(self) -> usize {
        match self {
            FormatKind::Unicode4k => 4096,
            _ => 512,
        }
    }

    pub fn page_trailer_size(self) -> usize {
        if self.is_wide() {
            16
        } else {
            12
        }
    }

    pub fn block_trailer_size(self) -> usize {
        if self.is_wide() {
            16
        } else {
            12
        }
    }

    /// Largest external-data payload a single block may carry.
    pub fn max_block_data(self) -> usize {
        8192 - self.block_trailer_size()
    }

    pub fn name(self) -> &'static str {
        match self {
            FormatKind::Ansi => "ansi",
            FormatKind::Unicode => "unicode",
            FormatKind::Unicode4k => "unicode-4k",
        }
    }
}

// ── Bref ─────────────────────────────────────────────────────────────────────

/// Block reference: block id plus absolute byte offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bref {
    pub bid: u64,
    pub ib: u64,
}

impl Bref {
    pub fn read<R: Read>(mut r: R, kind: FormatKind) -> io::Result<Self> {
        if kind.is_wide() {
            Ok(Self {
                bid: r.read_u64::<LittleEndian>()?,
                ib: r.read_u64::<LittleEndian>()?,
            })
        } else {
            Ok(Self {
                bid: r.read_u32::<LittleEndian>()? as u64,
                ib: r.read_u32::<LittleEndian>()? as u64,
            })
        }
    }
}

fn read_index<R: Read>(mut r: R, kind: FormatKind) -> io::Result<u64> {
    if kind.is_wide() {
        r.read_u64::<LittleEndian>()
    } else {
        Ok(r.read_u32::<LittleEndian>()? as u64)
    }
}

// ── Root ─────────────────────────────────────────────────────────────────────

/// The ROOT record inside the header.
#[derive(Debug, Clone)]
pub struct Root {
    pub file_eof: u64,
    pub amap_last: u64,
    pub amap_free: u64,
    pub pmap_free: u64,
    /// Node B-tree root page.
    pub nbt: Bref,
    /// Block B-tree root page.
    pub bbt: Bref,
    pub amap_valid: bool,
}

impl Root {
    fn read<R: Read>(mut r: R, kind: FormatKind) -> io::Result<Self> {
        let _reserved = r.read_u32::<LittleEndian>()?;
        let file_eof = read_index(&mut r, kind)?;
        let amap_last = read_index(&mut r, kind)?;
        let amap_free = read_index(&mut r, kind)?;
        let pmap_free = read_index(&mut r, kind)?;
        let nbt = Bref::read(&mut r, kind)?;
        let bbt = Bref::read(&mut r, kind)?;
        let amap_valid = r.read_u8()? != 0;
        Ok(Self {
            file_eof,
            amap_last,
            amap_free,
            pmap_free,
            nbt,
            bbt,
            amap_valid,
        })
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Header {
    pub kind: FormatKind,
    pub ver: u16,
    pub ver_client: u16,
    pub crypt: CryptMethod,
    pub unique: u32,
    pub root: Root,
}

impl Header {
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = vec![0u8; HEADER_SIZE_ANSI];
        reader
            .read_exact(&mut buf)
            .map_err(|_| PstError::InvalidFormat("file shorter than the header".into()))?;

        let mut cur = Cursor::new(&buf[..]);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(PstError::InvalidFormat(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let crc_partial = cur.read_u32::<LittleEndian>()?;
        let magic_client = cur.read_u16::<LittleEndian>()?;
        if magic_client != MAGIC_CLIENT {
            return Err(PstError::InvalidFormat(format!(
                "bad client magic {magic_client:#06x}"
            )));
        }
        let ver = cur.read_u16::<LittleEndian>()?;
        let ver_client = cur.read_u16::<LittleEndian>()?;
        let kind = FormatKind::from_version(ver)
            .ok_or_else(|| PstError::InvalidFormat(format!("unsupported version {ver}")))?;

        if kind.is_wide() {
            buf.resize(HEADER_SIZE_WIDE, 0);
            reader
                .read_exact(&mut buf[HEADER_SIZE_ANSI..])
                .map_err(|_| PstError::InvalidFormat("file shorter than the header".into()))?;
        }

        if compute_crc(0, &buf[CRC_START..CRC_START + CRC_PARTIAL_LEN]) != crc_partial {
            return Err(PstError::InvalidFormat("header CRC mismatch".into()));
        }
        if kind.is_wide() {
            let crc_full = u32::from_le_bytes([buf[524], buf[525], buf[526], buf[527]]);
            if compute_crc(0, &buf[CRC_START..CRC_START + CRC_FULL_LEN]) != crc_full {
                return Err(PstError::InvalidFormat("header full CRC mismatch".into()));
            }
        }

        let (root_off, unique_off, sentinel_off) = if kind.is_wide() {
            (180, 40, 512)
        } else {
            (164, 32, 460)
        };

        if buf[sentinel_off] != SENTINEL {
            return Err(PstError::InvalidFormat(format!(
                "bad sentinel byte {:#04x}",
                buf[sentinel_off]
            )));
        }
        let crypt = CryptMethod::from_raw(buf[sentinel_off + 1]).ok_or_else(|| {
            PstError::InvalidFormat(format!(
                "unknown crypt method {:#04x}",
                buf[sentinel_off + 1]
            ))
        })?;

        let unique = u32::from_le_bytes([
            buf[unique_off],
            buf[unique_off + 1],
            buf[unique_off + 2],
            buf[unique_off + 3],
        ]);
        let root = Root::read(Cursor::new(&buf[root_off..]), kind)?;

        Ok(Self {
            kind,
            ver,
            ver_client,
            crypt,
            unique,
            root,
        })
    }
}
