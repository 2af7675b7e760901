//! Core HFA container engine.
//!
//! An HFA container is self-describing: a textual type dictionary embedded
//! in the file defines the layout of every object ("entry") stored in it.
//! [`HfaFile`] owns the file handle, parses the dictionary into a
//! [`TypeDictionary`], and exposes the entry tree with path-based typed
//! accessors; all byte interpretation is delegated to the dictionary's
//! type and field descriptors.

pub mod dictionary;
pub mod entry;
pub mod error;
pub mod field;
pub mod path;
pub mod rle;
pub mod typedef;
pub mod utils;

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, warn};

pub use dictionary::{TypeDictionary, TypeId};
pub use entry::{EntryId, RandomAccess, ENTRY_HEADER_SIZE};
pub use error::{HfaError, Result};
pub use field::{FieldDescriptor, FieldValue, ItemType, Pointer, SampleType, SetSource};
pub use path::{FieldPath, PathSeg};
pub use typedef::{SizeState, TypeDefinition};

use entry::EntryStore;

/// Magic tag at byte 0 of every container.
pub const MAGIC: &[u8; 16] = b"EHFA_HEADER_TAG\0";

/// Upper bound on embedded dictionary text; a container claiming more is
/// corrupt.
const MAX_DICTIONARY_SIZE: usize = 16 << 20;

/// An open HFA container: file handle, type dictionary, and entry tree.
///
/// The engine is strictly single-threaded; the handle and the entry arena
/// sit behind `RefCell`s so that read accessors can lazily materialize
/// entry data. Dirty entries are written back by [`HfaFile::flush`], which
/// [`HfaFile::close`] (and, best-effort, `Drop`) invokes — dropping an
/// unflushed container without checking the result risks silent data loss,
/// so write sessions should always end in an explicit `close` or `flush`.
pub struct HfaFile {
    handle: RefCell<Box<dyn RandomAccess>>,
    dictionary: TypeDictionary,
    entries: RefCell<EntryStore>,
    root: EntryId,
    version: u32,
}

impl HfaFile {
    /// Open a container read-only. Field writes will still be accepted in
    /// memory but flushing them fails at the handle.
    pub fn open(path: impl AsRef<Path>) -> Result<HfaFile> {
        let path = path.as_ref();
        info!("Opening HFA container: {}", path.display());
        let file = File::open(path)?;
        Self::from_handle(Box::new(file))
    }

    /// Open a container for reading and writing.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<HfaFile> {
        let path = path.as_ref();
        info!("Opening HFA container for update: {}", path.display());
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_handle(Box::new(file))
    }

    /// Open a container from any random-access handle, e.g. an in-memory
    /// buffer.
    ///
    /// # Errors
    /// Returns an error if the magic tag or file header is malformed, or if
    /// the embedded dictionary fails to parse — a container is unusable
    /// without its dictionary.
    pub fn from_handle(mut handle: Box<dyn RandomAccess>) -> Result<HfaFile> {
        // The handle may arrive mid-file, e.g. when reopening one a previous
        // session read through.
        handle.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 16];
        handle.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HfaError::InvalidFormat(
                "missing EHFA_HEADER_TAG magic".to_string(),
            ));
        }
        let header_pos = handle.read_u32::<LittleEndian>()? as u64;

        handle.seek(SeekFrom::Start(header_pos))?;
        let version = handle.read_u32::<LittleEndian>()?;
        let _free_list = handle.read_u32::<LittleEndian>()?;
        let root_pos = handle.read_u32::<LittleEndian>()? as u64;
        let entry_header_length = handle.read_u16::<LittleEndian>()?;
        let dictionary_pos = handle.read_u32::<LittleEndian>()? as u64;

        if entry_header_length as usize != ENTRY_HEADER_SIZE {
            warn!(
                "container declares {}-byte entry headers, expected {}",
                entry_header_length, ENTRY_HEADER_SIZE
            );
        }
        if root_pos == 0 {
            return Err(HfaError::InvalidFormat("container has no root entry".to_string()));
        }

        let text = read_dictionary(&mut *handle, dictionary_pos)?;
        let dictionary = TypeDictionary::parse(&text)?;
        debug!("dictionary holds {} types", dictionary.len());

        let mut entries = EntryStore::default();
        let root = entries.load(&mut *handle, &dictionary, root_pos)?;
        info!(
            "HFA container opened: version {}, root entry {:?}",
            version,
            entries.node(root).name
        );

        Ok(HfaFile {
            handle: RefCell::new(handle),
            dictionary,
            entries: RefCell::new(entries),
            root,
            version,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dictionary(&self) -> &TypeDictionary {
        &self.dictionary
    }

    /// The root of the entry tree.
    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn entry_name(&self, id: EntryId) -> String {
        self.entries.borrow().node(id).name.clone()
    }

    pub fn entry_type_name(&self, id: EntryId) -> String {
        self.entries.borrow().node(id).type_name.clone()
    }

    pub fn entry_data_size(&self, id: EntryId) -> u64 {
        self.entries.borrow().node(id).data_size
    }

    // ---------------------------------------------------------------------
    // Tree navigation
    // ---------------------------------------------------------------------

    pub fn child(&self, id: EntryId) -> Result<Option<EntryId>> {
        let mut handle = self.handle.borrow_mut();
        self.entries
            .borrow_mut()
            .child(&mut **handle, &self.dictionary, id)
    }

    pub fn next(&self, id: EntryId) -> Result<Option<EntryId>> {
        let mut handle = self.handle.borrow_mut();
        self.entries
            .borrow_mut()
            .next(&mut **handle, &self.dictionary, id)
    }

    /// First child whose name matches exactly.
    pub fn named_child(&self, id: EntryId, name: &str) -> Result<Option<EntryId>> {
        let mut handle = self.handle.borrow_mut();
        self.entries
            .borrow_mut()
            .named_child(&mut **handle, &self.dictionary, id, name)
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    pub fn get_int(&self, id: EntryId, path: &str) -> Result<i32> {
        self.get_int_path(id, &FieldPath::parse(path)?)
    }

    pub fn get_int_path(&self, id: EntryId, path: &FieldPath) -> Result<i32> {
        self.with_entry(id, |ty, data, pos, dict| {
            ty.extract_value(path.segments(), data, pos, dict)?.as_int()
        })
    }

    pub fn get_double(&self, id: EntryId, path: &str) -> Result<f64> {
        self.get_double_path(id, &FieldPath::parse(path)?)
    }

    pub fn get_double_path(&self, id: EntryId, path: &FieldPath) -> Result<f64> {
        self.with_entry(id, |ty, data, pos, dict| {
            ty.extract_value(path.segments(), data, pos, dict)?.as_double()
        })
    }

    pub fn get_string(&self, id: EntryId, path: &str) -> Result<String> {
        self.get_string_path(id, &FieldPath::parse(path)?)
    }

    pub fn get_string_path(&self, id: EntryId, path: &FieldPath) -> Result<String> {
        self.with_entry(id, |ty, data, pos, dict| {
            ty.extract_value(path.segments(), data, pos, dict)?.into_string()
        })
    }

    /// Live element count of the field a path names.
    pub fn get_count(&self, id: EntryId, path: &str) -> Result<u32> {
        let path = FieldPath::parse(path)?;
        self.with_entry(id, |ty, data, _, dict| {
            ty.field_count(path.segments(), data, dict)
        })
    }

    pub fn set_int(&self, id: EntryId, path: &str, value: i32) -> Result<()> {
        self.set_field(id, &FieldPath::parse(path)?, SetSource::Int(value))
    }

    pub fn set_double(&self, id: EntryId, path: &str, value: f64) -> Result<()> {
        self.set_field(id, &FieldPath::parse(path)?, SetSource::Double(value))
    }

    pub fn set_string(&self, id: EntryId, path: &str, value: &str) -> Result<()> {
        self.set_field(id, &FieldPath::parse(path)?, SetSource::Str(value))
    }

    /// Insert a value along a pre-parsed path, marking the entry dirty on
    /// success.
    pub fn set_field(&self, id: EntryId, path: &FieldPath, value: SetSource) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        let mut handle = self.handle.borrow_mut();
        entries.load_data(&mut **handle, id)?;
        let node = entries.node_mut(id);
        let ty = match node.type_id {
            Some(type_id) => self.dictionary.get(type_id),
            None => return Err(HfaError::UnknownType(node.type_name.clone())),
        };
        let data_pos = node.data_pos;
        let data = node.data.as_mut().ok_or_else(|| {
            HfaError::InvalidFormat(format!("entry {:?} has no data buffer", node.name))
        })?;
        match ty.set_value(path.segments(), data, data_pos, &self.dictionary, value) {
            Ok(()) => {
                node.data_dirty = true;
                Ok(())
            }
            Err(err) => {
                debug!("set on entry {:?} failed: {}", node.name, err);
                Err(err)
            }
        }
    }

    fn with_entry<R>(
        &self,
        id: EntryId,
        f: impl FnOnce(&TypeDefinition, &[u8], u64, &TypeDictionary) -> Result<R>,
    ) -> Result<R> {
        let mut entries = self.entries.borrow_mut();
        let mut handle = self.handle.borrow_mut();
        entries.load_data(&mut **handle, id)?;
        let node = entries.node(id);
        let ty = match node.type_id {
            Some(type_id) => self.dictionary.get(type_id),
            None => return Err(HfaError::UnknownType(node.type_name.clone())),
        };
        let data = node.data.as_ref().ok_or_else(|| {
            HfaError::InvalidFormat(format!("entry {:?} has no data buffer", node.name))
        })?;
        f(ty, data, node.data_pos, &self.dictionary).map_err(|err| {
            debug!("field access on entry {:?} failed: {}", node.name, err);
            err
        })
    }

    // ---------------------------------------------------------------------
    // Write path
    // ---------------------------------------------------------------------

    /// (Re)allocate an entry's owned buffer, reserving file space when the
    /// current allocation is too small.
    pub fn make_data(&self, id: EntryId, min_size: usize) -> Result<()> {
        let mut handle = self.handle.borrow_mut();
        self.entries
            .borrow_mut()
            .make_data(&mut **handle, id, min_size)
    }

    /// Append a brand-new entry of a dictionary type and link it as the last
    /// child of `parent`. Its zeroed data buffer is flushed with everything
    /// else.
    pub fn create_entry(
        &self,
        parent: EntryId,
        name: &str,
        type_name: &str,
        data_size: usize,
    ) -> Result<EntryId> {
        let mut handle = self.handle.borrow_mut();
        self.entries.borrow_mut().create(
            &mut **handle,
            &self.dictionary,
            parent,
            name,
            type_name,
            data_size,
        )
    }

    /// Write every dirty entry back at its file offset.
    pub fn flush(&self) -> Result<()> {
        let mut handle = self.handle.borrow_mut();
        self.entries.borrow_mut().flush_all(&mut **handle)
    }

    /// Flush and drop the container. Surfacing the flush result here is the
    /// difference between this and letting the container drop: a failed
    /// flush is data loss.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

impl Drop for HfaFile {
    fn drop(&mut self) {
        if self.entries.borrow().any_dirty() {
            if let Err(err) = self.flush() {
                log::error!("flush on drop failed, writes were lost: {}", err);
            }
        }
    }
}

/// Read the dictionary text at `pos`, in chunks, up to its `.` terminator.
fn read_dictionary(handle: &mut dyn RandomAccess, pos: u64) -> Result<String> {
    handle.seek(SeekFrom::Start(pos))?;
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = handle.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        if let Some(stop) = chunk[..n].iter().position(|&b| b == b'.') {
            bytes.extend_from_slice(&chunk[..=stop]);
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
        if bytes.len() > MAX_DICTIONARY_SIZE {
            return Err(HfaError::DictionaryParse(
                "dictionary text has no terminator".to_string(),
            ));
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| HfaError::DictionaryParse("dictionary text is not valid UTF-8".to_string()))
}
