//! Property Context: a BTH keyed by 16-bit property id whose entries are
//! a wire type plus four inline bytes doubling as an HNID for anything
//! larger.

use crate::block::BlockReader;
use crate::error::{PstError, Result};
use crate::heap::{self, BthTable, HeapNode, CLIENT_SIG_PC};
use crate::index::NodeEntry;
use crate::props::{decode_value, PropType, PropertyValue};

pub struct PropertyContext<'a> {
    reader: &'a BlockReader,
    node: NodeEntry,
    heap: HeapNode,
    bth: BthTable,
}

impl<'a> PropertyContext<'a> {
    pub fn read(reader: &'a BlockReader, node: NodeEntry) -> Result<Self> {
        let heap = HeapNode::read(reader, &node)?;
        if heap.client_sig() != CLIENT_SIG_PC {
            return Err(PstError::CorruptBlock(format!(
                "node {:#x} is not a property context (client sig {:#04x})",
                node.nid,
                heap.client_sig()
            )));
        }
        let bth = BthTable::parse(&heap, heap.user_root())?;
        if bth.key_size() != 2 || bth.entry_size() != 6 {
            return Err(PstError::CorruptBlock(format!(
                "bad property tree geometry (key {}, entry {})",
                bth.key_size(),
                bth.entry_size()
            )));
        }
        Ok(Self {
            reader,
            node,
            heap,
            bth,
        })
    }

    /// Number of properties present on this node.
    pub fn len(&self) -> usize {
        self.bth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bth.is_empty()
    }

    /// Raw wire type and inline dword for a property, if present. Lets
    /// callers reach the HNID of a large value without materializing it.
    pub fn raw(&self, prop_id: u16) -> Option<(u16, u32)> {
        let entry = self.bth.find(&prop_id.to_le_bytes())?;
        let ptype = u16::from_le_bytes([entry[0], entry[1]]);
        let dword = u32::from_le_bytes([entry[2], entry[3], entry[4], entry[5]]);
        Some((ptype, dword))
    }

    /// Fetches and decodes one property. Absent properties are `Ok(None)`;
    /// a present property that cannot be materialized is an error.
    pub fn get(&self, prop_id: u16) -> Result<Option<PropertyValue>> {
        let Some((raw_type, dword)) = self.raw(prop_id) else {
            return Ok(None);
        };
        let value = if let Some(width) = PropType::from_raw(raw_type).inline_size() {
            decode_value(raw_type, &dword.to_le_bytes()[..width])?
        } else if dword == 0 {
            // An HNID of zero stands for the empty value of the type.
            decode_value(raw_type, &[])?
        } else {
            let bytes = heap::resolve_hnid(self.reader, &self.node, &self.heap, dword)?;
            decode_value(raw_type, &bytes)?
        };
        Ok(Some(value))
    }

    /// String property shortcut used by the archive accessors.
    pub fn get_string(&self, prop_id: u16) -> Result<Option<String>> {
        Ok(match self.get(prop_id)? {
            Some(PropertyValue::String(s)) => Some(s),
            _ => None,
        })
    }

    /// Property ids present on this node, in ascending order.
    pub fn prop_ids(&self) -> Vec<u16> {
        self.bth
            .records()
            .map(|(k, _)| u16::from_le_bytes([k[0], k[1]]))
            .collect()
    }
}
