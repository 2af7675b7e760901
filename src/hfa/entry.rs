//! The entry tree: nodes binding one type instance each to a byte range of
//! the container file.
//!
//! On disk the tree is held together by file-position links (each node
//! records where its next sibling and first child live). In memory the
//! nodes live in an arena indexed by [`EntryId`]; links resolve to ids
//! lazily on traversal and the resolution is cached, so no node ever owns
//! another and position 0 uniformly means "no link".

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, warn};

use super::dictionary::{TypeDictionary, TypeId};
use super::error::{HfaError, Result};
use super::utils;

/// Random-access handle to container bytes. Blanket-implemented for any
/// seekable reader/writer, which lets tests run against in-memory buffers.
pub trait RandomAccess: Read + Write + Seek {}
impl<T: Read + Write + Seek> RandomAccess for T {}

/// On-disk size of one entry header: six u32 links/sizes, a 64-byte name, a
/// 32-byte type name, and a modification time.
pub const ENTRY_HEADER_SIZE: usize = 124;

const NAME_SIZE: usize = 64;
const TYPE_NAME_SIZE: usize = 32;

/// Handle to one entry in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct EntryNode {
    /// File position of this node's header.
    pub pos: u64,
    pub next_pos: u64,
    pub prev_pos: u64,
    pub parent_pos: u64,
    pub child_pos: u64,
    pub data_pos: u64,
    pub data_size: u64,
    pub mod_time: u32,
    pub name: String,
    pub type_name: String,
    /// Resolved dictionary handle; `None` when the dictionary has no such
    /// type, in which case field access fails but traversal still works.
    pub type_id: Option<TypeId>,
    /// Raw bytes, materialized on first field access.
    pub data: Option<Vec<u8>>,
    pub data_dirty: bool,
    pub header_dirty: bool,
    // Cached link resolutions.
    next: Option<EntryId>,
    child: Option<EntryId>,
}

impl EntryNode {
    fn decode(pos: u64, header: &[u8], dict: &TypeDictionary) -> Result<EntryNode> {
        let name = fixed_string(&header[24..24 + NAME_SIZE]);
        let type_name = fixed_string(&header[24 + NAME_SIZE..24 + NAME_SIZE + TYPE_NAME_SIZE]);
        let type_id = dict.find_by_name(&type_name);
        if type_id.is_none() && !type_name.is_empty() {
            warn!("entry {:?} has unknown type {:?}", name, type_name);
        }
        Ok(EntryNode {
            pos,
            next_pos: utils::read_u32(header, 0)? as u64,
            prev_pos: utils::read_u32(header, 4)? as u64,
            parent_pos: utils::read_u32(header, 8)? as u64,
            child_pos: utils::read_u32(header, 12)? as u64,
            data_pos: utils::read_u32(header, 16)? as u64,
            data_size: utils::read_u32(header, 20)? as u64,
            mod_time: utils::read_u32(header, 24 + NAME_SIZE + TYPE_NAME_SIZE)?,
            name,
            type_name,
            type_id,
            data: None,
            data_dirty: false,
            header_dirty: false,
            next: None,
            child: None,
        })
    }

    fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        // Header buffer is fixed-size; these writes cannot fail.
        let _ = utils::write_u32(&mut header, 0, self.next_pos as u32);
        let _ = utils::write_u32(&mut header, 4, self.prev_pos as u32);
        let _ = utils::write_u32(&mut header, 8, self.parent_pos as u32);
        let _ = utils::write_u32(&mut header, 12, self.child_pos as u32);
        let _ = utils::write_u32(&mut header, 16, self.data_pos as u32);
        let _ = utils::write_u32(&mut header, 20, self.data_size as u32);
        let name = self.name.as_bytes();
        header[24..24 + name.len()].copy_from_slice(name);
        let type_name = self.type_name.as_bytes();
        header[24 + NAME_SIZE..24 + NAME_SIZE + type_name.len()].copy_from_slice(type_name);
        let _ = utils::write_u32(&mut header, 24 + NAME_SIZE + TYPE_NAME_SIZE, self.mod_time);
        header
    }
}

/// NUL-terminated fixed-width ASCII field.
fn fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Arena of entry nodes indexed by file position.
#[derive(Debug, Default)]
pub(crate) struct EntryStore {
    nodes: Vec<EntryNode>,
    by_pos: HashMap<u64, EntryId>,
}

impl EntryStore {
    pub fn node(&self, id: EntryId) -> &EntryNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: EntryId) -> &mut EntryNode {
        &mut self.nodes[id.0]
    }

    /// Resolve the node at `pos`, reading its header from the file on first
    /// sight and caching the resolution.
    pub fn load(
        &mut self,
        file: &mut dyn RandomAccess,
        dict: &TypeDictionary,
        pos: u64,
    ) -> Result<EntryId> {
        if let Some(&id) = self.by_pos.get(&pos) {
            return Ok(id);
        }
        file.seek(SeekFrom::Start(pos))?;
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let node = EntryNode::decode(pos, &header, dict)?;
        debug!(
            "loaded entry {:?} ({}) at {}",
            node.name, node.type_name, pos
        );
        let id = EntryId(self.nodes.len());
        self.by_pos.insert(pos, id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Next sibling, resolved and cached on demand.
    pub fn next(
        &mut self,
        file: &mut dyn RandomAccess,
        dict: &TypeDictionary,
        id: EntryId,
    ) -> Result<Option<EntryId>> {
        if let Some(next) = self.nodes[id.0].next {
            return Ok(Some(next));
        }
        let pos = self.nodes[id.0].next_pos;
        if pos == 0 {
            return Ok(None);
        }
        let next = self.load(file, dict, pos)?;
        self.nodes[id.0].next = Some(next);
        Ok(Some(next))
    }

    /// First child, resolved and cached on demand.
    pub fn child(
        &mut self,
        file: &mut dyn RandomAccess,
        dict: &TypeDictionary,
        id: EntryId,
    ) -> Result<Option<EntryId>> {
        if let Some(child) = self.nodes[id.0].child {
            return Ok(Some(child));
        }
        let pos = self.nodes[id.0].child_pos;
        if pos == 0 {
            return Ok(None);
        }
        let child = self.load(file, dict, pos)?;
        self.nodes[id.0].child = Some(child);
        Ok(Some(child))
    }

    /// Scan children for the first whose name matches exactly.
    pub fn named_child(
        &mut self,
        file: &mut dyn RandomAccess,
        dict: &TypeDictionary,
        id: EntryId,
        name: &str,
    ) -> Result<Option<EntryId>> {
        let mut at = self.child(file, dict, id)?;
        while let Some(child) = at {
            if self.nodes[child.0].name == name {
                return Ok(Some(child));
            }
            at = self.next(file, dict, child)?;
        }
        Ok(None)
    }

    /// Materialize the node's raw bytes on first access.
    pub fn load_data(&mut self, file: &mut dyn RandomAccess, id: EntryId) -> Result<()> {
        let node = &mut self.nodes[id.0];
        if node.data.is_some() {
            return Ok(());
        }
        if node.data_size == 0 {
            node.data = Some(Vec::new());
            return Ok(());
        }
        if node.data_pos == 0 {
            return Err(HfaError::InvalidFormat(format!(
                "entry {:?} declares {} data bytes but no data position",
                node.name, node.data_size
            )));
        }
        file.seek(SeekFrom::Start(node.data_pos))?;
        let mut buffer = vec![0u8; node.data_size as usize];
        file.read_exact(&mut buffer)?;
        node.data = Some(buffer);
        Ok(())
    }

    /// (Re)allocate the node's owned buffer, used when building a brand-new
    /// entry instead of reading an existing one. An existing allocation
    /// large enough is kept; otherwise fresh file space is reserved at the
    /// end of the container and the old region is abandoned.
    pub fn make_data(
        &mut self,
        file: &mut dyn RandomAccess,
        id: EntryId,
        min_size: usize,
    ) -> Result<()> {
        if self.nodes[id.0].data_size as usize >= min_size && self.nodes[id.0].data_pos != 0 {
            return self.load_data(file, id);
        }
        let pos = reserve(file, min_size)?;
        let node = &mut self.nodes[id.0];
        let mut buffer = node.data.take().unwrap_or_default();
        buffer.resize(min_size, 0);
        node.data = Some(buffer);
        node.data_pos = pos;
        node.data_size = min_size as u64;
        node.data_dirty = true;
        node.header_dirty = true;
        Ok(())
    }

    /// Append a brand-new entry and link it as `parent`'s last child.
    pub fn create(
        &mut self,
        file: &mut dyn RandomAccess,
        dict: &TypeDictionary,
        parent: EntryId,
        name: &str,
        type_name: &str,
        data_size: usize,
    ) -> Result<EntryId> {
        if name.len() >= NAME_SIZE {
            return Err(HfaError::InvalidFormat(format!(
                "entry name {:?} exceeds {} bytes",
                name,
                NAME_SIZE - 1
            )));
        }
        if type_name.len() >= TYPE_NAME_SIZE {
            return Err(HfaError::InvalidFormat(format!(
                "type name {:?} exceeds {} bytes",
                type_name,
                TYPE_NAME_SIZE - 1
            )));
        }
        let type_id = dict.find_by_name(type_name);
        if type_id.is_none() {
            return Err(HfaError::UnknownType(type_name.to_string()));
        }

        // Resolve the link point first: traversal may pull more nodes into
        // the arena, so the new id must be allocated after it.
        let last_sibling = match self.child(file, dict, parent)? {
            None => None,
            Some(first) => {
                let mut last = first;
                while let Some(next) = self.next(file, dict, last)? {
                    last = next;
                }
                Some(last)
            }
        };

        // Reserve header and data space together at the end of the file.
        let pos = reserve(file, ENTRY_HEADER_SIZE + data_size)?;
        let data_pos = if data_size > 0 {
            pos + ENTRY_HEADER_SIZE as u64
        } else {
            0
        };

        let id = EntryId(self.nodes.len());
        let mut node = EntryNode {
            pos,
            next_pos: 0,
            prev_pos: 0,
            parent_pos: self.nodes[parent.0].pos,
            child_pos: 0,
            data_pos,
            data_size: data_size as u64,
            mod_time: 0,
            name: name.to_string(),
            type_name: type_name.to_string(),
            type_id,
            data: Some(vec![0u8; data_size]),
            data_dirty: data_size > 0,
            header_dirty: true,
            next: None,
            child: None,
        };

        // Link after the last existing sibling, or directly as first child.
        match last_sibling {
            None => {
                let parent_node = &mut self.nodes[parent.0];
                parent_node.child_pos = pos;
                parent_node.child = Some(id);
                parent_node.header_dirty = true;
            }
            Some(last) => {
                node.prev_pos = self.nodes[last.0].pos;
                let last_node = &mut self.nodes[last.0];
                last_node.next_pos = pos;
                last_node.next = Some(id);
                last_node.header_dirty = true;
            }
        }

        self.by_pos.insert(pos, id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Write one entry back: its header when relinked or newly created, and
    /// exactly `data_size` bytes at `data_pos` when its buffer is dirty. A
    /// clean entry performs no write.
    pub fn flush_entry(&mut self, file: &mut dyn RandomAccess, id: EntryId) -> Result<()> {
        let node = &mut self.nodes[id.0];
        if node.header_dirty {
            file.seek(SeekFrom::Start(node.pos))?;
            file.write_all(&node.encode())?;
            node.header_dirty = false;
        }
        if node.data_dirty {
            let data = node.data.as_ref().ok_or_else(|| {
                HfaError::InvalidFormat(format!("dirty entry {:?} has no buffer", node.name))
            })?;
            file.seek(SeekFrom::Start(node.data_pos))?;
            file.write_all(data)?;
            node.data_dirty = false;
            debug!("flushed {} bytes of entry {:?}", data.len(), node.name);
        }
        Ok(())
    }

    /// Flush every dirty entry, strictly one at a time against the shared
    /// handle.
    pub fn flush_all(&mut self, file: &mut dyn RandomAccess) -> Result<()> {
        for id in 0..self.nodes.len() {
            self.flush_entry(file, EntryId(id))?;
        }
        file.flush()?;
        Ok(())
    }

    pub fn any_dirty(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| node.data_dirty || node.header_dirty)
    }
}

/// Reserve `size` zeroed bytes at the end of the file, returning their
/// position.
fn reserve(file: &mut dyn RandomAccess, size: usize) -> Result<u64> {
    let pos = file.seek(SeekFrom::End(0))?;
    file.write_all(&vec![0u8; size])?;
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encode_decode_round_trip() {
        let dict = TypeDictionary::parse("{1:lwidth,}Eimg_Size,.").unwrap();
        let node = EntryNode {
            pos: 500,
            next_pos: 1000,
            prev_pos: 200,
            parent_pos: 100,
            child_pos: 0,
            data_pos: 624,
            data_size: 4,
            mod_time: 7,
            name: "thumbnail".to_string(),
            type_name: "Eimg_Size".to_string(),
            type_id: None,
            data: None,
            data_dirty: false,
            header_dirty: false,
            next: None,
            child: None,
        };
        let header = node.encode();
        let back = EntryNode::decode(500, &header, &dict).unwrap();
        assert_eq!(back.next_pos, 1000);
        assert_eq!(back.prev_pos, 200);
        assert_eq!(back.parent_pos, 100);
        assert_eq!(back.child_pos, 0);
        assert_eq!(back.data_pos, 624);
        assert_eq!(back.data_size, 4);
        assert_eq!(back.mod_time, 7);
        assert_eq!(back.name, "thumbnail");
        assert_eq!(back.type_name, "Eimg_Size");
        assert!(back.type_id.is_some());
    }
}
