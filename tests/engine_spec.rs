//! End-to-end tests against hand-assembled in-memory containers.

use std::cell::RefCell;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use hfa_engine::{HfaError, HfaFile};

/// Random-access buffer the test keeps a handle on, so bytes written through
/// the engine can be inspected after the container is closed.
#[derive(Clone)]
struct SharedBuffer(Rc<RefCell<Cursor<Vec<u8>>>>);

impl SharedBuffer {
    fn new(bytes: Vec<u8>) -> SharedBuffer {
        SharedBuffer(Rc::new(RefCell::new(Cursor::new(bytes))))
    }

    /// Copy of the underlying bytes. Distinctly named so it cannot shadow
    /// or collide with the `Read` trait's own `bytes` adapter.
    fn snapshot(&self) -> Vec<u8> {
        self.0.borrow().get_ref().clone()
    }
}

impl Read for SharedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.borrow_mut().seek(pos)
    }
}

const DICT: &str =
    "{1:lwidth,1:lheight,}Eimg_Size,{16:clabel,1:e2:off,on,flag,1:ddistance,}Eprj_Info,.";

const ROOT_POS: u64 = 40;
const ROOT_DATA: u64 = 164;
const CHILD_DATA: u64 = 296;

fn entry_header(
    next: u32,
    prev: u32,
    parent: u32,
    child: u32,
    data: u32,
    size: u32,
    name: &str,
    type_name: &str,
) -> Vec<u8> {
    let mut h = vec![0u8; 124];
    h[0..4].copy_from_slice(&next.to_le_bytes());
    h[4..8].copy_from_slice(&prev.to_le_bytes());
    h[8..12].copy_from_slice(&parent.to_le_bytes());
    h[12..16].copy_from_slice(&child.to_le_bytes());
    h[16..20].copy_from_slice(&data.to_le_bytes());
    h[20..24].copy_from_slice(&size.to_le_bytes());
    h[24..24 + name.len()].copy_from_slice(name.as_bytes());
    h[88..88 + type_name.len()].copy_from_slice(type_name.as_bytes());
    h
}

/// A two-entry container: a root `Eimg_Size` (width 64, height 32) with one
/// `Eprj_Info` child (label "Albers", flag "on", distance 2.5).
fn build_container() -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(b"EHFA_HEADER_TAG\0");
    f.extend_from_slice(&20u32.to_le_bytes()); // file header position
    f.extend_from_slice(&1u32.to_le_bytes()); // version
    f.extend_from_slice(&0u32.to_le_bytes()); // free list
    f.extend_from_slice(&(ROOT_POS as u32).to_le_bytes());
    f.extend_from_slice(&124u16.to_le_bytes()); // entry header length
    f.extend_from_slice(&322u32.to_le_bytes()); // dictionary position
    f.resize(ROOT_POS as usize, 0);

    f.extend_from_slice(&entry_header(0, 0, 0, 172, ROOT_DATA as u32, 8, "root", "Eimg_Size"));
    f.extend_from_slice(&64u32.to_le_bytes());
    f.extend_from_slice(&32u32.to_le_bytes());

    f.extend_from_slice(&entry_header(
        0,
        0,
        ROOT_POS as u32,
        0,
        CHILD_DATA as u32,
        26,
        "Projection",
        "Eprj_Info",
    ));
    let mut label = [0u8; 16];
    label[..6].copy_from_slice(b"Albers");
    f.extend_from_slice(&label);
    f.extend_from_slice(&1u16.to_le_bytes());
    f.extend_from_slice(&2.5f64.to_le_bytes());

    assert_eq!(f.len(), 322);
    f.extend_from_slice(DICT.as_bytes());
    f
}

fn open(buffer: &SharedBuffer) -> HfaFile {
    HfaFile::from_handle(Box::new(buffer.clone())).unwrap()
}

#[test]
fn opens_and_reads_typed_fields() {
    let buffer = SharedBuffer::new(build_container());
    let file = open(&buffer);

    assert_eq!(file.version(), 1);
    let root = file.root();
    assert_eq!(file.entry_name(root), "root");
    assert_eq!(file.entry_type_name(root), "Eimg_Size");
    assert_eq!(file.get_int(root, "width").unwrap(), 64);
    assert_eq!(file.get_int(root, "height").unwrap(), 32);
    assert_eq!(file.get_double(root, "width").unwrap(), 64.0);
    assert_eq!(file.get_count(root, "width").unwrap(), 1);

    let proj = file.named_child(root, "Projection").unwrap().unwrap();
    assert_eq!(file.entry_type_name(proj), "Eprj_Info");
    assert_eq!(file.get_string(proj, "label").unwrap(), "Albers");
    assert_eq!(file.get_int(proj, "flag").unwrap(), 1);
    assert_eq!(file.get_string(proj, "flag").unwrap(), "on");
    assert_eq!(file.get_double(proj, "distance").unwrap(), 2.5);

    assert!(file.named_child(root, "nothing").unwrap().is_none());
    assert!(matches!(
        file.get_int(root, "depth"),
        Err(HfaError::FieldNotFound(_))
    ));
}

#[test]
fn set_flush_reopen_round_trip() {
    let buffer = SharedBuffer::new(build_container());
    {
        let file = open(&buffer);
        let root = file.root();
        file.set_int(root, "width", 1000).unwrap();
        let proj = file.named_child(root, "Projection").unwrap().unwrap();
        file.set_string(proj, "label", "Lambert").unwrap();
        file.set_string(proj, "flag", "off").unwrap();
        file.set_double(proj, "distance", -3.25).unwrap();
        file.close().unwrap();
    }

    let file = open(&buffer);
    let root = file.root();
    assert_eq!(file.get_int(root, "width").unwrap(), 1000);
    assert_eq!(file.get_int(root, "height").unwrap(), 32);
    let proj = file.named_child(root, "Projection").unwrap().unwrap();
    assert_eq!(file.get_string(proj, "label").unwrap(), "Lambert");
    assert_eq!(file.get_int(proj, "flag").unwrap(), 0);
    assert_eq!(file.get_double(proj, "distance").unwrap(), -3.25);
}

#[test]
fn flush_touches_only_dirty_entry_data() {
    let original = build_container();
    let buffer = SharedBuffer::new(original.clone());
    let file = open(&buffer);
    file.set_int(file.root(), "width", 1000).unwrap();
    file.flush().unwrap();
    drop(file);

    let after = buffer.snapshot();
    assert_eq!(after.len(), original.len());
    let data = ROOT_DATA as usize;
    assert_eq!(&after[data..data + 4], &1000u32.to_le_bytes());
    // Everything outside the dirty entry's data window is untouched.
    assert_eq!(&after[..data], &original[..data]);
    assert_eq!(&after[data + 8..], &original[data + 8..]);
}

#[test]
fn clean_container_flushes_to_identical_bytes() {
    let original = build_container();
    let buffer = SharedBuffer::new(original.clone());
    let file = open(&buffer);
    let root = file.root();
    let _ = file.get_int(root, "width").unwrap();
    let proj = file.named_child(root, "Projection").unwrap().unwrap();
    let _ = file.get_string(proj, "label").unwrap();
    file.close().unwrap();
    assert_eq!(buffer.snapshot(), original);
}

#[test]
fn created_entry_survives_reopen() {
    let buffer = SharedBuffer::new(build_container());
    {
        let file = open(&buffer);
        let root = file.root();
        let stats = file.create_entry(root, "Statistics", "Eimg_Size", 8).unwrap();
        file.set_int(stats, "width", 7).unwrap();
        file.set_int(stats, "height", 9).unwrap();
        file.close().unwrap();
    }

    let file = open(&buffer);
    let root = file.root();
    // Appended as the last sibling, after the existing child.
    let first = file.child(root).unwrap().unwrap();
    assert_eq!(file.entry_name(first), "Projection");
    let second = file.next(first).unwrap().unwrap();
    assert_eq!(file.entry_name(second), "Statistics");
    assert!(file.next(second).unwrap().is_none());

    let stats = file.named_child(root, "Statistics").unwrap().unwrap();
    assert_eq!(file.get_int(stats, "width").unwrap(), 7);
    assert_eq!(file.get_int(stats, "height").unwrap(), 9);
}

#[test]
fn create_rejects_unknown_type_and_long_names() {
    let buffer = SharedBuffer::new(build_container());
    let file = open(&buffer);
    let root = file.root();
    assert!(matches!(
        file.create_entry(root, "X", "NoSuchType", 0),
        Err(HfaError::UnknownType(_))
    ));
    let long = "x".repeat(64);
    assert!(file.create_entry(root, &long, "Eimg_Size", 0).is_err());
}

#[test]
fn embedded_dictionary_round_trips_through_text() {
    let buffer = SharedBuffer::new(build_container());
    let file = open(&buffer);
    assert_eq!(file.dictionary().to_text(), DICT);
    let sizes: Vec<_> = file
        .dictionary()
        .iter()
        .map(|ty| (ty.name.clone(), ty.fixed_size()))
        .collect();
    assert_eq!(
        sizes,
        vec![
            ("Eimg_Size".to_string(), Some(8)),
            ("Eprj_Info".to_string(), Some(26)),
        ]
    );
}

#[test]
fn rejects_wrong_magic() {
    let mut bytes = build_container();
    bytes[0] = b'X';
    let err = HfaFile::from_handle(Box::new(Cursor::new(bytes)));
    assert!(matches!(err, Err(HfaError::InvalidFormat(_))));
}
