//! Table Context: fixed-width rows packed into heap items or sub-node
//! blocks, with a column descriptor array and a cell existence bitmap
//! per row.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::BlockReader;
use crate::error::{PstError, Result};
use crate::heap::{self, hnid_is_hid, BthTable, HeapNode, CLIENT_SIG_TC};
use crate::index::NodeEntry;
use crate::props::{decode_value, PropType, PropertyValue};

#[derive(Debug, Clone, Copy)]
pub struct TcColumn {
    pub prop_id: u16,
    pub prop_type: u16,
    pub offset: u16,
    pub size: u8,
    pub bit: u8,
}

enum RowStore {
    Empty,
    /// All rows in one heap item.
    Heap(Vec<u8>),
    /// Rows spread over the blocks of a sub-node; rows never straddle a
    /// block boundary.
    Blocks(Vec<Vec<u8>>),
}

pub struct TableContext<'a> {
    reader: &'a BlockReader,
    node: NodeEntry,
    heap: HeapNode,
    columns: Vec<TcColumn>,
    row_width: usize,
    ceb_offset: usize,
    row_index: Vec<u32>,
    rows: RowStore,
    rows_per_block: usize,
}

impl<'a> TableContext<'a> {
    pub fn read(reader: &'a BlockReader, node: NodeEntry) -> Result<Self> {
        let heap = HeapNode::read(reader, &node)?;
        if heap.client_sig() != CLIENT_SIG_TC {
            return Err(PstError::CorruptBlock(format!(
                "node {:#x} is not a table context (client sig {:#04x})",
                node.nid,
                heap.client_sig()
            )));
        }
        let info = heap.item(heap.user_root())?.to_vec();
        let mut cur = Cursor::new(info.as_slice());
        let btype = cur.read_u8()?;
        if btype != CLIENT_SIG_TC {
            return Err(PstError::CorruptBlock(format!(
                "bad table info type byte {btype:#04x}"
            )));
        }
        let col_count = cur.read_u8()? as usize;
        let mut group_ends = [0u16; 4];
        for end in &mut group_ends {
            *end = cur.read_u16::<LittleEndian>()?;
        }
        let ceb_offset = group_ends[2] as usize;
        let row_width = group_ends[3] as usize;
        let hid_row_index = cur.read_u32::<LittleEndian>()?;
        let hnid_rows = cur.read_u32::<LittleEndian>()?;
        let _hid_index = cur.read_u32::<LittleEndian>()?; // deprecated
        if row_width == 0 || ceb_offset >= row_width {
            return Err(PstError::CorruptBlock(format!(
                "bad table row geometry (width {row_width}, bitmap at {ceb_offset})"
            )));
        }

        let mut columns = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let tag = cur.read_u32::<LittleEndian>()?;
            let offset = cur.read_u16::<LittleEndian>()?;
            let size = cur.read_u8()?;
            let bit = cur.read_u8()?;
            if offset as usize + size as usize > row_width {
                return Err(PstError::CorruptBlock(format!(
                    "column {:#06x} overruns the row",
                    tag >> 16
                )));
            }
            columns.push(TcColumn {
                prop_id: (tag >> 16) as u16,
                prop_type: tag as u16,
                offset,
                size,
                bit,
            });
        }

        let row_index = read_row_index(&heap, hid_row_index)?;
        let rows = if hnid_rows == 0 {
            RowStore::Empty
        } else if hnid_is_hid(hnid_rows) {
            RowStore::Heap(heap.item(hnid_rows)?.to_vec())
        } else {
            let entry = reader.sub_node_entry(node.bid_sub, hnid_rows)?.ok_or_else(|| {
                PstError::CorruptBlock(format!("missing row data sub-node {hnid_rows:#x}"))
            })?;
            RowStore::Blocks(reader.read_data_tree(entry.bid_data)?)
        };
        let rows_per_block = reader.kind().max_block_data() / row_width;

        Ok(Self {
            reader,
            node,
            heap,
            columns,
            row_width,
            ceb_offset,
            row_index,
            rows,
            rows_per_block,
        })
    }

    pub fn row_count(&self) -> usize {
        self.row_index.len()
    }

    pub fn columns(&self) -> &[TcColumn] {
        &self.columns
    }

    /// Row id at a position in table order.
    pub fn row_id(&self, pos: usize) -> Result<u32> {
        self.row_index.get(pos).copied().ok_or_else(|| {
            PstError::NotFound(format!("row {pos} of {}", self.row_index.len()))
        })
    }

    pub fn row_ids(&self) -> &[u32] {
        &self.row_index
    }

    fn row_bytes(&self, pos: usize) -> Result<&[u8]> {
        if pos >= self.row_index.len() {
            return Err(PstError::NotFound(format!(
                "row {pos} of {}",
                self.row_index.len()
            )));
        }
        let (block, offset) = match &self.rows {
            RowStore::Empty => {
                return Err(PstError::CorruptBlock(
                    "row index points into empty row storage".into(),
                ))
            }
            RowStore::Heap(data) => (data.as_slice(), pos * self.row_width),
            RowStore::Blocks(blocks) => {
                let block = blocks.get(pos / self.rows_per_block).ok_or_else(|| {
                    PstError::CorruptBlock(format!("row {pos} past the last row block"))
                })?;
                (block.as_slice(), (pos % self.rows_per_block) * self.row_width)
            }
        };
        block.get(offset..offset + self.row_width).ok_or_else(|| {
            PstError::CorruptBlock(format!("row {pos} extends past its block"))
        })
    }

    /// Fetches one cell. `Ok(None)` when the column is absent from the
    /// table or its existence bit is clear for this row.
    pub fn cell(&self, pos: usize, prop_id: u16) -> Result<Option<PropertyValue>> {
        let Some(col) = self.columns.iter().find(|c| c.prop_id == prop_id) else {
            return Ok(None);
        };
        let row = self.row_bytes(pos)?;
        let ceb = &row[self.ceb_offset..];
        let byte = (col.bit / 8) as usize;
        if byte >= ceb.len() || ceb[byte] & (1 << (7 - col.bit % 8)) == 0 {
            return Ok(None);
        }
        let cell = &row[col.offset as usize..col.offset as usize + col.size as usize];
        let value = match PropType::from_raw(col.prop_type).fixed_size() {
            Some(width) if width == cell.len() => decode_value(col.prop_type, cell)?,
            _ => {
                // Variable-width cells hold a four byte HNID.
                if cell.len() != 4 {
                    return Err(PstError::CorruptBlock(format!(
                        "column {prop_id:#06x} has width {} but no fixed type",
                        cell.len()
                    )));
                }
                let hnid = u32::from_le_bytes(cell.try_into().unwrap());
                if hnid == 0 {
                    decode_value(col.prop_type, &[])?
                } else {
                    let bytes =
                        heap::resolve_hnid(self.reader, &self.node, &self.heap, hnid)?;
                    decode_value(col.prop_type, &bytes)?
                }
            }
        };
        Ok(Some(value))
    }

    pub fn cell_string(&self, pos: usize, prop_id: u16) -> Result<Option<String>> {
        Ok(match self.cell(pos, prop_id)? {
            Some(PropertyValue::String(s)) => Some(s),
            _ => None,
        })
    }
}

/// The row index BTH maps row id to position; invert it into a dense
/// position-ordered list of row ids.
fn read_row_index(heap: &HeapNode, hid: u32) -> Result<Vec<u32>> {
    if hid == 0 {
        return Ok(Vec::new());
    }
    let bth = BthTable::parse(heap, hid)?;
    if bth.key_size() != 4 || bth.entry_size() != 4 {
        return Err(PstError::CorruptBlock(format!(
            "bad row index geometry (key {}, entry {})",
            bth.key_size(),
            bth.entry_size()
        )));
    }
    let mut ids = vec![0u32; bth.len()];
    for (key, entry) in bth.records() {
        let row_id = u32::from_le_bytes(key.try_into().unwrap());
        let pos = u32::from_le_bytes(entry.try_into().unwrap()) as usize;
        if pos >= ids.len() {
            return Err(PstError::CorruptBlock(format!(
                "row index position {pos} out of range"
            )));
        }
        ids[pos] = row_id;
    }
    Ok(ids)
}
