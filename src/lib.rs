//! pstrip: a read-only structural parser for PST email archives.
//!
//! The crate opens an archive, validates its header, walks the node and
//! block B-trees, and exposes folders, messages and attachments through
//! a borrowing façade:
//!
//! ```no_run
//! use pstrip::PstArchive;
//!
//! # fn main() -> pstrip::Result<()> {
//! let archive = PstArchive::open("mail.pst")?;
//! let root = archive.root_folder()?;
//! for folder in root.sub_folders()? {
//!     println!("{}", folder.display_name()?.unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Everything is read-only. Corrupt structures surface as errors rather
//! than panics, and reference cycles in the on-disk trees are detected
//! instead of looping.

pub mod archive;
pub mod block;
pub mod crc;
pub mod crypt;
pub mod error;
pub mod header;
pub mod heap;
pub mod index;
pub mod page;
pub mod pc;
pub mod props;
pub mod tc;

pub use archive::{Attachment, AttachmentReader, Child, Folder, Message, PstArchive};
pub use crypt::CryptMethod;
pub use error::{PstError, Result};
pub use header::{FormatKind, Header};
pub use pc::PropertyContext;
pub use props::{PropertyValue, tags};
pub use tc::TableContext;
