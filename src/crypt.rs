//! The two in-format block ciphers.
//!
//! Neither is real cryptography: "permute" is a fixed byte substitution,
//! "cyclic" mixes the same tables with a rolling counter seeded from the
//! block id. Both exist so the payload bytes are not directly greppable
//! on disk, and both must round-trip exactly.

/// Archive-wide crypt method, fixed in the header at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    None,
    Permute,
    Cyclic,
}

impl CryptMethod {
    pub fn from_raw(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(CryptMethod::None),
            0x01 => Some(CryptMethod::Permute),
            0x02 => Some(CryptMethod::Cyclic),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            CryptMethod::None => 0x00,
            CryptMethod::Permute => 0x01,
            CryptMethod::Cyclic => 0x02,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CryptMethod::None => "none",
            CryptMethod::Permute => "permute",
            CryptMethod::Cyclic => "cyclic",
        }
    }
}

// Substitution rows. I is the decode substitution, S the independent
// middle row of the cyclic cipher (a self-inverse permutation). The
// encode row R is derived at compile time as the inverse of I.
const TABLE_I: [u8; 256] = [
    0x47, 0xF1, 0xB4, 0xE6, 0x0B, 0x6A, 0x72, 0x48, 0x85, 0x4E, 0x9E, 0xEB, 0xE2, 0xF8, 0x94, 0x53,
    0xE0, 0xBB, 0xA0, 0x02, 0xE8, 0x5A, 0x09, 0xAB, 0xDB, 0xE3, 0xBA, 0xC6, 0x7C, 0xC3, 0x10, 0xDD,
    0x39, 0x05, 0x96, 0x30, 0xF5, 0x37, 0x60, 0x82, 0x8C, 0xC9, 0x13, 0x4A, 0x6B, 0x1D, 0xF3, 0xFB,
    0x8F, 0x26, 0x97, 0xCA, 0x91, 0x17, 0x01, 0xC4, 0x32, 0x2D, 0x6E, 0x31, 0x95, 0xFF, 0xD9, 0x23,
    0xD1, 0x00, 0x5E, 0x79, 0xDC, 0x44, 0x3B, 0x1A, 0x28, 0xC5, 0x61, 0x57, 0x20, 0x90, 0x3D, 0x83,
    0xB9, 0x43, 0xBE, 0x67, 0xD2, 0x46, 0x42, 0x76, 0xC0, 0x6D, 0x5B, 0x7E, 0xB2, 0x0F, 0x16, 0x29,
    0x3C, 0xA9, 0x03, 0x54, 0x0D, 0xDA, 0x5D, 0xDF, 0xF6, 0xB7, 0xC7, 0x62, 0xCD, 0x8D, 0x06, 0xD3,
    0x69, 0x5C, 0x86, 0xD6, 0x14, 0xF7, 0xA5, 0x66, 0x75, 0xAC, 0xB1, 0xE9, 0x45, 0x21, 0x70, 0x0C,
    0x87, 0x9F, 0x74, 0xA4, 0x22, 0x4C, 0x6F, 0xBF, 0x1F, 0x56, 0xAA, 0x2E, 0xB3, 0x78, 0x33, 0x50,
    0xB0, 0xA3, 0x92, 0xBC, 0xCF, 0x19, 0x1C, 0xA7, 0x63, 0xCB, 0x1E, 0x4D, 0x3E, 0x4B, 0x1B, 0x9B,
    0x4F, 0xE7, 0xF0, 0xEE, 0xAD, 0x3A, 0xB5, 0x59, 0x04, 0xEA, 0x40, 0x55, 0x25, 0x51, 0xE5, 0x7A,
    0x89, 0x38, 0x68, 0x52, 0x7B, 0xFC, 0x27, 0xAE, 0xD7, 0xBD, 0xFA, 0x07, 0xF4, 0xCC, 0x8E, 0x5F,
    0xEF, 0x35, 0x9C, 0x84, 0x2B, 0x15, 0xD5, 0x77, 0x34, 0x49, 0xB6, 0x12, 0x0A, 0x7F, 0x71, 0x88,
    0xFD, 0x9D, 0x18, 0x41, 0x7D, 0x93, 0xD8, 0x58, 0x2C, 0xCE, 0xFE, 0x24, 0xAF, 0xDE, 0xB8, 0x36,
    0xC8, 0xA1, 0x80, 0xA6, 0x99, 0x98, 0xA8, 0x2F, 0x0E, 0x81, 0x65, 0x73, 0xE4, 0xC2, 0xA2, 0x8A,
    0xD4, 0xE1, 0x11, 0xD0, 0x08, 0x8B, 0x2A, 0xF2, 0xED, 0x9A, 0x64, 0x3F, 0xC1, 0x6C, 0xF9, 0xEC,
];

const TABLE_S: [u8; 256] = [
    0x14, 0x53, 0x0F, 0x56, 0xB3, 0xC8, 0x7A, 0x9C, 0xEB, 0x65, 0x48, 0x17, 0x16, 0x15, 0x9F, 0x02,
    0xCC, 0x54, 0x7C, 0x83, 0x00, 0x0D, 0x0C, 0x0B, 0xA2, 0x62, 0xA8, 0x76, 0xDB, 0xD9, 0xED, 0xC7,
    0xC5, 0xA4, 0xDC, 0xAC, 0x85, 0x74, 0xD6, 0xD0, 0xA7, 0x9B, 0xAE, 0x9A, 0x96, 0x71, 0x66, 0xC3,
    0x63, 0x99, 0xB8, 0xDD, 0x73, 0x92, 0x8E, 0x84, 0x7D, 0xA5, 0x5E, 0xD1, 0x5D, 0x93, 0xB1, 0x57,
    0x41, 0x40, 0x80, 0x89, 0x52, 0x94, 0x4F, 0x4E, 0x0A, 0x6B, 0xBC, 0x8D, 0x7F, 0x6E, 0x47, 0x46,
    0x51, 0x50, 0x44, 0x01, 0x11, 0xCB, 0x03, 0x3F, 0xF7, 0xF4, 0xE1, 0xA9, 0x8F, 0x3C, 0x3A, 0xF9,
    0xFB, 0xF0, 0x19, 0x30, 0x82, 0x09, 0x2E, 0xC9, 0x9D, 0xA0, 0x86, 0x49, 0xEE, 0x6F, 0x4D, 0x6D,
    0xC4, 0x2D, 0x81, 0x34, 0x25, 0x87, 0x1B, 0x88, 0xAA, 0xFC, 0x06, 0xA1, 0x12, 0x38, 0xFD, 0x4C,
    0x42, 0x72, 0x64, 0x13, 0x37, 0x24, 0x6A, 0x75, 0x77, 0x43, 0xFF, 0xE6, 0xB4, 0x4B, 0x36, 0x5C,
    0xE4, 0xD8, 0x35, 0x3D, 0x45, 0xB9, 0x2C, 0xEC, 0xB7, 0x31, 0x2B, 0x29, 0x07, 0x68, 0xA3, 0x0E,
    0x69, 0x7B, 0x18, 0x9E, 0x21, 0x39, 0xBE, 0x28, 0x1A, 0x5B, 0x78, 0xF5, 0x23, 0xCA, 0x2A, 0xB0,
    0xAF, 0x3E, 0xFE, 0x04, 0x8C, 0xE7, 0xE5, 0x98, 0x32, 0x95, 0xD3, 0xF6, 0x4A, 0xE8, 0xA6, 0xEA,
    0xE9, 0xF3, 0xD5, 0x2F, 0x70, 0x20, 0xF2, 0x1F, 0x05, 0x67, 0xAD, 0x55, 0x10, 0xCE, 0xCD, 0xE3,
    0x27, 0x3B, 0xD7, 0xBA, 0xE2, 0xC2, 0x26, 0xD2, 0x91, 0x1D, 0xF8, 0x1C, 0x22, 0x33, 0xE0, 0xFA,
    0xDE, 0x5A, 0xD4, 0xCF, 0x90, 0xB6, 0x8B, 0xB5, 0xBD, 0xC0, 0xBF, 0x08, 0x97, 0x1E, 0x6C, 0xF1,
    0x61, 0xEF, 0xC6, 0xC1, 0x59, 0xAB, 0xBB, 0x58, 0xDA, 0x5F, 0xDF, 0x60, 0x79, 0x7E, 0xB2, 0x8A,
];

const fn invert(table: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inv[table[i] as usize] = i as u8;
        i += 1;
    }
    inv
}

const TABLE_R: [u8; 256] = invert(&TABLE_I);

// ── Permute ──────────────────────────────────────────────────────────────────

pub fn permute_encode(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = TABLE_R[*b as usize];
    }
}

pub fn permute_decode(data: &mut [u8]) {
    for b in data.iter_mut() {
        *b = TABLE_I[*b as usize];
    }
}

// ── Cyclic ───────────────────────────────────────────────────────────────────

fn cyclic_counter(key: u32) -> u16 {
    (key ^ (key >> 16)) as u16
}

// R and I cancel and S is self-inverse, so one pass is its own inverse
// and encode and decode share a body.
fn cyclic_pass(data: &mut [u8], key: u32) {
    let mut w = cyclic_counter(key);
    for b in data.iter_mut() {
        let lo = w as u8;
        let hi = (w >> 8) as u8;
        let mut t = b.wrapping_add(lo);
        t = TABLE_R[t as usize];
        t = t.wrapping_add(hi);
        t = TABLE_S[t as usize];
        t = t.wrapping_sub(hi);
        t = TABLE_I[t as usize];
        *b = t.wrapping_sub(lo);
        w = w.wrapping_add(1);
    }
}

pub fn cyclic_encode(data: &mut [u8], key: u32) {
    cyclic_pass(data, key);
}

pub fn cyclic_decode(data: &mut [u8], key: u32) {
    cyclic_pass(data, key);
}
