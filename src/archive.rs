//! High-level read-only view of an archive: the store, folders, messages
//! and attachments, layered over the node index and block reader.

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::block::BlockReader;
use crate::crypt::CryptMethod;
use crate::error::{PstError, Result};
use crate::header::{FormatKind, Header};
use crate::index::{
    make_nid, nid_type, NodeEntry, NID_ATTACHMENT_TABLE, NID_MESSAGE_STORE, NID_RECIPIENT_TABLE,
    NID_ROOT_FOLDER,
    NID_TYPE_ATTACHMENT, NID_TYPE_CONTENTS_TABLE, NID_TYPE_HIERARCHY_TABLE,
    NID_TYPE_NORMAL_FOLDER, NID_TYPE_NORMAL_MESSAGE,
};
use crate::pc::PropertyContext;
use crate::props::{tags, PropertyValue};
use crate::tc::TableContext;

// ── Archive ──────────────────────────────────────────────────────────────────

/// An opened archive. All access is read-only; handles to folders,
/// messages and attachments borrow the archive and go through its single
/// block reader.
pub struct PstArchive {
    path: PathBuf,
    header: Header,
    reader: BlockReader,
}

impl PstArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_file(file, path.to_path_buf())
    }

    pub fn from_file(mut file: File, path: PathBuf) -> Result<Self> {
        let header = Header::read(&mut file)?;
        debug!(
            "opened {} ({}, crypt {})",
            path.display(),
            header.kind.name(),
            header.crypt.name()
        );
        let reader = BlockReader::new(file, &header);
        Ok(Self {
            path,
            header,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn format(&self) -> FormatKind {
        self.header.kind
    }

    pub fn crypt_method(&self) -> CryptMethod {
        self.header.crypt
    }

    /// Display name of the message store node.
    pub fn store_display_name(&self) -> Result<Option<String>> {
        self.property_context(NID_MESSAGE_STORE)?
            .get_string(tags::DISPLAY_NAME)
    }

    pub fn root_folder(&self) -> Result<Folder<'_>> {
        self.folder(NID_ROOT_FOLDER)
    }

    pub fn folder(&self, nid: u32) -> Result<Folder<'_>> {
        if nid_type(nid) != NID_TYPE_NORMAL_FOLDER {
            return Err(PstError::NotFound(format!("{nid:#x} is not a folder id")));
        }
        let node = self.reader.lookup_node(nid)?;
        let props = PropertyContext::read(&self.reader, node)?;
        Ok(Folder {
            reader: &self.reader,
            nid,
            props,
            contents: None,
            contents_loaded: false,
            cursor: 0,
        })
    }

    pub fn message(&self, nid: u32) -> Result<Message<'_>> {
        if nid_type(nid) != NID_TYPE_NORMAL_MESSAGE {
            return Err(PstError::NotFound(format!("{nid:#x} is not a message id")));
        }
        let node = self.reader.lookup_node(nid)?;
        let props = PropertyContext::read(&self.reader, node.clone())?;
        Ok(Message {
            reader: &self.reader,
            node,
            props,
        })
    }

    /// Raw property context of any node, for callers walking the archive
    /// below the folder/message surface.
    pub fn property_context(&self, nid: u32) -> Result<PropertyContext<'_>> {
        let node = self.reader.lookup_node(nid)?;
        PropertyContext::read(&self.reader, node)
    }

    pub fn table_context(&self, nid: u32) -> Result<TableContext<'_>> {
        let node = self.reader.lookup_node(nid)?;
        TableContext::read(&self.reader, node)
    }

    /// Concatenated data of a node's block tree.
    pub fn read_node(&self, nid: u32) -> Result<Vec<u8>> {
        let node = self.reader.lookup_node(nid)?;
        self.reader.read_node_data(node.bid_data)
    }
}

// ── Folder ───────────────────────────────────────────────────────────────────

/// A folder plus a cursor over its contents table. The hierarchy and
/// contents tables are sibling nodes sharing the folder's index bits.
pub struct Folder<'a> {
    reader: &'a BlockReader,
    nid: u32,
    props: PropertyContext<'a>,
    contents: Option<TableContext<'a>>,
    contents_loaded: bool,
    cursor: usize,
}

pub enum Child<'a> {
    Folder(Folder<'a>),
    Message(Message<'a>),
}

impl<'a> Folder<'a> {
    pub fn nid(&self) -> u32 {
        self.nid
    }

    pub fn display_name(&self) -> Result<Option<String>> {
        self.props.get_string(tags::DISPLAY_NAME)
    }

    pub fn content_count(&self) -> Result<Option<i32>> {
        Ok(self.props.get(tags::CONTENT_COUNT)?.and_then(|v| v.as_i32()))
    }

    pub fn has_sub_folders(&self) -> Result<bool> {
        Ok(self
            .props
            .get(tags::SUBFOLDERS)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub fn properties(&self) -> &PropertyContext<'a> {
        &self.props
    }

    /// Child folders in hierarchy-table order. A folder without a
    /// hierarchy table has none, but only if its own properties agree;
    /// a missing table under a folder that claims sub-folders is
    /// structural damage, not emptiness.
    pub fn sub_folders(&self) -> Result<Vec<Folder<'a>>> {
        let table_nid = make_nid(NID_TYPE_HIERARCHY_TABLE, self.nid >> 5);
        let node = match self.reader.lookup_node(table_nid) {
            Ok(node) => node,
            Err(PstError::NotFound(_)) => {
                if self.has_sub_folders()? {
                    return Err(PstError::CorruptBlock(format!(
                        "folder {:#x} claims sub-folders but hierarchy table {table_nid:#x} is missing",
                        self.nid
                    )));
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let table = TableContext::read(self.reader, node)?;
        let mut out = Vec::with_capacity(table.row_count());
        for &child_nid in table.row_ids() {
            out.push(open_folder(self.reader, child_nid)?);
        }
        Ok(out)
    }

    /// Advances the contents cursor and yields the next child, or
    /// `Ok(None)` once exhausted. Repeated calls past the end stay
    /// `Ok(None)`.
    pub fn next_child(&mut self) -> Result<Option<Child<'a>>> {
        if !self.contents_loaded {
            let table_nid = make_nid(NID_TYPE_CONTENTS_TABLE, self.nid >> 5);
            self.contents = match self.reader.lookup_node(table_nid) {
                Ok(node) => Some(TableContext::read(self.reader, node)?),
                Err(PstError::NotFound(_)) => {
                    let claimed = self.content_count()?.unwrap_or(0);
                    if claimed > 0 {
                        return Err(PstError::CorruptBlock(format!(
                            "folder {:#x} claims {claimed} contents but table {table_nid:#x} is missing",
                            self.nid
                        )));
                    }
                    None
                }
                Err(e) => return Err(e),
            };
            self.contents_loaded = true;
        }
        let Some(table) = &self.contents else {
            return Ok(None);
        };
        while self.cursor < table.row_count() {
            let child_nid = table.row_id(self.cursor)?;
            self.cursor += 1;
            match nid_type(child_nid) {
                NID_TYPE_NORMAL_MESSAGE => {
                    let node = self.reader.lookup_node(child_nid)?;
                    let props = PropertyContext::read(self.reader, node.clone())?;
                    return Ok(Some(Child::Message(Message {
                        reader: self.reader,
                        node,
                        props,
                    })));
                }
                NID_TYPE_NORMAL_FOLDER => {
                    return Ok(Some(Child::Folder(open_folder(self.reader, child_nid)?)));
                }
                other => {
                    debug!("skipping contents row {child_nid:#x} (type {other:#x})");
                }
            }
        }
        Ok(None)
    }

    /// Rewinds the contents cursor to the first child.
    pub fn reset_child_cursor(&mut self) {
        self.cursor = 0;
    }
}

fn open_folder<'a>(reader: &'a BlockReader, nid: u32) -> Result<Folder<'a>> {
    let node = reader.lookup_node(nid)?;
    let props = PropertyContext::read(reader, node)?;
    Ok(Folder {
        reader,
        nid,
        props,
        contents: None,
        contents_loaded: false,
        cursor: 0,
    })
}

// ── Message ──────────────────────────────────────────────────────────────────

pub struct Message<'a> {
    reader: &'a BlockReader,
    node: NodeEntry,
    props: PropertyContext<'a>,
}

impl<'a> Message<'a> {
    pub fn nid(&self) -> u32 {
        self.node.nid
    }

    /// Subject with the thread-prefix marker pair stripped. Writers
    /// prepend 0x01 and a prefix-length byte when the subject carries a
    /// reply prefix.
    pub fn subject(&self) -> Result<Option<String>> {
        Ok(self.props.get_string(tags::SUBJECT)?.map(|s| {
            let mut chars = s.chars();
            if chars.next() == Some('\u{1}') {
                chars.next();
                chars.as_str().to_string()
            } else {
                s
            }
        }))
    }

    pub fn sender_name(&self) -> Result<Option<String>> {
        self.props.get_string(tags::SENDER_NAME)
    }

    pub fn sender_email(&self) -> Result<Option<String>> {
        self.props.get_string(tags::SENDER_EMAIL_ADDRESS)
    }

    pub fn display_to(&self) -> Result<Option<String>> {
        self.props.get_string(tags::DISPLAY_TO)
    }

    pub fn message_class(&self) -> Result<Option<String>> {
        self.props.get_string(tags::MESSAGE_CLASS)
    }

    pub fn client_submit_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(match self.props.get(tags::CLIENT_SUBMIT_TIME)? {
            Some(PropertyValue::Time(t)) => Some(t),
            _ => None,
        })
    }

    pub fn body(&self) -> Result<Option<String>> {
        self.props.get_string(tags::BODY)
    }

    pub fn html_body(&self) -> Result<Option<Vec<u8>>> {
        Ok(match self.props.get(tags::HTML_BODY)? {
            Some(PropertyValue::Binary(b)) => Some(b),
            Some(PropertyValue::String(s)) => Some(s.into_bytes()),
            _ => None,
        })
    }

    pub fn properties(&self) -> &PropertyContext<'a> {
        &self.props
    }

    /// Opens a table hosted in this message's sub-node tree.
    fn sub_table(&self, table_nid: u32) -> Result<Option<TableContext<'a>>> {
        let Some(entry) = self.reader.sub_node_entry(self.node.bid_sub, table_nid)? else {
            return Ok(None);
        };
        let node = NodeEntry {
            nid: entry.nid,
            bid_data: entry.bid_data,
            bid_sub: entry.bid_sub,
            parent_nid: self.node.nid,
        };
        Ok(Some(TableContext::read(self.reader, node)?))
    }

    fn attachment_table(&self) -> Result<Option<TableContext<'a>>> {
        self.sub_table(NID_ATTACHMENT_TABLE)
    }

    /// Recipient table, when the message carries one.
    pub fn recipient_table(&self) -> Result<Option<TableContext<'a>>> {
        self.sub_table(NID_RECIPIENT_TABLE)
    }

    /// Recipient display names in table order.
    pub fn recipient_names(&self) -> Result<Vec<String>> {
        let Some(table) = self.recipient_table()? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(table.row_count());
        for i in 0..table.row_count() {
            if let Some(name) = table.cell_string(i, tags::DISPLAY_NAME)? {
                out.push(name);
            }
        }
        Ok(out)
    }

    /// Number of attachments, from the attachment table's row count. A
    /// message without the table has none.
    pub fn attachment_count(&self) -> Result<usize> {
        Ok(self.attachment_table()?.map_or(0, |t| t.row_count()))
    }

    /// Opens the attachment at a table position. Attachment objects live
    /// in the message's sub-node tree, keyed by the table's row id.
    pub fn attachment(&self, index: usize) -> Result<Attachment<'a>> {
        let table = self
            .attachment_table()?
            .ok_or_else(|| PstError::NotFound(format!("attachment {index}")))?;
        let attach_nid = table.row_id(index)?;
        if nid_type(attach_nid) != NID_TYPE_ATTACHMENT {
            return Err(PstError::CorruptBlock(format!(
                "attachment row id {attach_nid:#x} has the wrong node type"
            )));
        }
        let entry = self
            .reader
            .sub_node_entry(self.node.bid_sub, attach_nid)?
            .ok_or_else(|| {
                PstError::CorruptBlock(format!("attachment sub-node {attach_nid:#x} missing"))
            })?;
        let node = NodeEntry {
            nid: entry.nid,
            bid_data: entry.bid_data,
            bid_sub: entry.bid_sub,
            parent_nid: self.node.nid,
        };
        let props = PropertyContext::read(self.reader, node.clone())?;
        Ok(Attachment {
            reader: self.reader,
            node,
            props,
        })
    }
}

// ── Attachment ───────────────────────────────────────────────────────────────

pub struct Attachment<'a> {
    reader: &'a BlockReader,
    node: NodeEntry,
    props: PropertyContext<'a>,
}

impl<'a> Attachment<'a> {
    pub fn nid(&self) -> u32 {
        self.node.nid
    }

    /// Long filename, falling back to the short one.
    pub fn long_filename(&self) -> Result<Option<String>> {
        if let Some(name) = self.props.get_string(tags::ATTACH_LONG_FILENAME)? {
            return Ok(Some(name));
        }
        self.props.get_string(tags::ATTACH_FILENAME)
    }

    pub fn size(&self) -> Result<Option<i32>> {
        Ok(self.props.get(tags::ATTACH_SIZE)?.and_then(|v| v.as_i32()))
    }

    pub fn method(&self) -> Result<Option<i32>> {
        Ok(self.props.get(tags::ATTACH_METHOD)?.and_then(|v| v.as_i32()))
    }

    pub fn properties(&self) -> &PropertyContext<'a> {
        &self.props
    }

    /// Whole attachment payload in memory.
    pub fn data(&self) -> Result<Vec<u8>> {
        match self.props.get(tags::ATTACH_DATA)? {
            Some(PropertyValue::Binary(b)) => Ok(b),
            Some(_) => Err(PstError::CorruptBlock(
                "attachment data has a non-binary type".into(),
            )),
            None => Ok(Vec::new()),
        }
    }

    /// Streams the payload block by block without materializing it. Large
    /// payloads stored in a sub-node are pulled lazily; heap-resident ones
    /// are served from memory.
    pub fn open_stream(&self) -> Result<AttachmentReader<'a>> {
        let Some((raw_type, hnid)) = self.props.raw(tags::ATTACH_DATA) else {
            return Ok(AttachmentReader::empty(self.reader));
        };
        if raw_type != 0x0102 {
            return Err(PstError::CorruptBlock(
                "attachment data has a non-binary type".into(),
            ));
        }
        if hnid == 0 {
            return Ok(AttachmentReader::empty(self.reader));
        }
        if crate::heap::hnid_is_hid(hnid) {
            // Small payload held in the property heap.
            let bytes = match self.props.get(tags::ATTACH_DATA)? {
                Some(PropertyValue::Binary(b)) => b,
                _ => Vec::new(),
            };
            return Ok(AttachmentReader {
                reader: self.reader,
                pending: VecDeque::new(),
                buf: bytes,
                pos: 0,
            });
        }
        let entry = self
            .reader
            .sub_node_entry(self.node.bid_sub, hnid)?
            .ok_or_else(|| {
                PstError::CorruptBlock(format!("attachment data sub-node {hnid:#x} missing"))
            })?;
        let (bids, total) = self.reader.data_tree_layout(entry.bid_data)?;
        debug!(
            "streaming attachment {:#x}: {} blocks, {total} bytes",
            self.node.nid,
            bids.len()
        );
        Ok(AttachmentReader {
            reader: self.reader,
            pending: bids.into(),
            buf: Vec::new(),
            pos: 0,
        })
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// `io::Read` over an attachment payload, pulling one data block per
/// refill so only a single block is resident at a time.
pub struct AttachmentReader<'a> {
    reader: &'a BlockReader,
    pending: VecDeque<u64>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> AttachmentReader<'a> {
    fn empty(reader: &'a BlockReader) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for AttachmentReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            let Some(bid) = self.pending.pop_front() else {
                return Ok(0);
            };
            self.buf = self
                .reader
                .read_block(bid)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.pos = 0;
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
