//! Field descriptors: the shape and codec of one field within a type.
//!
//! A [`FieldDescriptor`] is parsed from one field specification in the
//! dictionary text and knows how to extract and insert values of that field
//! directly against the raw byte window of an entry, including pointer
//! indirection, bit-packed sub-byte arrays, enumerations, nested object
//! types, and raster-sample blobs. This is the marshalling layer everything
//! else in the engine delegates to.

use log::warn;

use super::dictionary::{TypeDictionary, TypeId};
use super::error::{HfaError, Result};
use super::path::PathSeg;
use super::utils;

/// Size of the count + offset header that precedes a pointer field's payload.
pub const POINTER_HEADER_SIZE: usize = 8;

/// Size of the rows/columns/sample-type sub-header of a raster-sample blob.
pub const BLOB_HEADER_SIZE: usize = 12;

/// Pointer modifier on a field.
///
/// A pointer field stores a live element count and a payload offset in an
/// 8-byte header ahead of its payload, instead of having a count fixed by
/// the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pointer {
    #[default]
    None,
    /// `*` modifier: count + offset header, payload expected present.
    Indirect,
    /// `p` modifier: same header, payload semantically optional.
    Optional,
}

/// The closed set of item types a field can hold.
///
/// Each variant corresponds to one item-type character of the dictionary
/// grammar. Nested (`o`) and inline (`x`) object references both map to
/// [`ItemType::Object`]; an inline definition's body is skipped structurally
/// and the field degrades to an object reference with no resolvable type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ItemType {
    /// `1`: unsigned 1-bit, packed 8 per byte.
    U1,
    /// `2`: unsigned 2-bit, packed 4 per byte.
    U2,
    /// `4`: unsigned 4-bit, packed 2 per byte.
    U4,
    /// `c`: unsigned byte. Arrays of these double as character strings.
    #[default]
    UChar,
    /// `C`: signed byte.
    Char,
    /// `e`: enumerated 16-bit integer with an ordered symbolic name table.
    Enum(Vec<String>),
    /// `s`: unsigned 16-bit.
    U16,
    /// `S`: signed 16-bit.
    S16,
    /// `t`: time stored as unsigned 32-bit seconds.
    Time,
    /// `l`: unsigned 32-bit.
    U32,
    /// `L`: signed 32-bit.
    S32,
    /// `f`: 32-bit float.
    F32,
    /// `d`: 64-bit float.
    F64,
    /// `m`: single-precision complex (2 × f32).
    C64,
    /// `M`: double-precision complex (2 × f64).
    C128,
    /// `b`: raster-sample blob with its own rows/cols/sample-type sub-header.
    Basedata,
    /// `o` / `x`: instance(s) of another named type.
    Object,
}

impl ItemType {
    /// Dictionary grammar character for this item type.
    pub fn type_char(&self) -> char {
        match self {
            ItemType::U1 => '1',
            ItemType::U2 => '2',
            ItemType::U4 => '4',
            ItemType::UChar => 'c',
            ItemType::Char => 'C',
            ItemType::Enum(_) => 'e',
            ItemType::U16 => 's',
            ItemType::S16 => 'S',
            ItemType::Time => 't',
            ItemType::U32 => 'l',
            ItemType::S32 => 'L',
            ItemType::F32 => 'f',
            ItemType::F64 => 'd',
            ItemType::C64 => 'm',
            ItemType::C128 => 'M',
            ItemType::Basedata => 'b',
            ItemType::Object => 'o',
        }
    }

    /// Bit width for the packed sub-byte kinds, `None` otherwise.
    fn packed_bits(&self) -> Option<u32> {
        match self {
            ItemType::U1 => Some(1),
            ItemType::U2 => Some(2),
            ItemType::U4 => Some(4),
            _ => None,
        }
    }

    /// Intrinsic byte width of one element; `None` for sub-byte, blob and
    /// object kinds whose width is not a whole fixed number of bytes.
    fn item_size(&self) -> Option<u32> {
        match self {
            ItemType::UChar | ItemType::Char => Some(1),
            ItemType::Enum(_) | ItemType::U16 | ItemType::S16 => Some(2),
            ItemType::Time | ItemType::U32 | ItemType::S32 | ItemType::F32 => Some(4),
            ItemType::F64 | ItemType::C64 => Some(8),
            ItemType::C128 => Some(16),
            ItemType::U1 | ItemType::U2 | ItemType::U4 | ItemType::Basedata | ItemType::Object => {
                None
            }
        }
    }
}

/// Sample-type codes carried in the sub-header of a raster-sample blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U1,
    U2,
    U4,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F32,
    F64,
}

impl SampleType {
    pub fn code(&self) -> u16 {
        match self {
            SampleType::U1 => 0,
            SampleType::U2 => 1,
            SampleType::U4 => 2,
            SampleType::U8 => 3,
            SampleType::S8 => 4,
            SampleType::U16 => 5,
            SampleType::S16 => 6,
            SampleType::U32 => 7,
            SampleType::S32 => 8,
            SampleType::F32 => 9,
            SampleType::F64 => 10,
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            SampleType::U1 => 1,
            SampleType::U2 => 2,
            SampleType::U4 => 4,
            SampleType::U8 | SampleType::S8 => 8,
            SampleType::U16 | SampleType::S16 => 16,
            SampleType::U32 | SampleType::S32 | SampleType::F32 => 32,
            SampleType::F64 => 64,
        }
    }
}

impl TryFrom<u16> for SampleType {
    type Error = HfaError;
    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::U1),
            1 => Ok(Self::U2),
            2 => Ok(Self::U4),
            3 => Ok(Self::U8),
            4 => Ok(Self::S8),
            5 => Ok(Self::U16),
            6 => Ok(Self::S16),
            7 => Ok(Self::U32),
            8 => Ok(Self::S32),
            9 => Ok(Self::F32),
            10 => Ok(Self::F64),
            other => Err(HfaError::UnsupportedSampleType(other)),
        }
    }
}

/// A value extracted from a field, in its natural representation.
///
/// Conversion to the representation the caller asked for happens through the
/// `as_*` methods, which implement the numeric/textual conversion rules
/// (saturating double-to-int, rejection of non-finite floats, enum
/// name/value mapping).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Int(i64),
    Double(f64),
    /// Character-array data, referenced in place (no copy).
    Str(&'a str),
    /// An enumerated value with its resolved symbolic name, if the stored
    /// integer falls inside the name table.
    Enum { value: u16, name: Option<&'a str> },
    /// Raw bytes of a nested object instance.
    Raw(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    /// The value as a 32-bit integer. Doubles saturate; non-finite doubles
    /// and unparseable strings are out-of-range failures.
    pub fn as_int(&self) -> Result<i32> {
        match self {
            FieldValue::Int(v) => Ok((*v).clamp(i32::MIN as i64, i32::MAX as i64) as i32),
            FieldValue::Double(d) => utils::double_to_int(*d),
            FieldValue::Str(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|_| HfaError::OutOfRange(format!("cannot parse {:?} as integer", s))),
            FieldValue::Enum { value, .. } => Ok(*value as i32),
            FieldValue::Raw(_) => Err(HfaError::OutOfRange(
                "object instance has no integer representation".to_string(),
            )),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            FieldValue::Int(v) => Ok(*v as f64),
            FieldValue::Double(d) => Ok(*d),
            FieldValue::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| HfaError::OutOfRange(format!("cannot parse {:?} as double", s))),
            FieldValue::Enum { value, .. } => Ok(*value as f64),
            FieldValue::Raw(_) => Err(HfaError::OutOfRange(
                "object instance has no double representation".to_string(),
            )),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            FieldValue::Int(v) => Ok(v.to_string()),
            FieldValue::Double(d) => Ok(d.to_string()),
            FieldValue::Str(s) => Ok(s.to_string()),
            FieldValue::Enum { value, name } => match name {
                Some(name) => Ok(name.to_string()),
                None => Err(HfaError::OutOfRange(format!(
                    "enum value {} has no symbolic name",
                    value
                ))),
            },
            FieldValue::Raw(_) => Err(HfaError::OutOfRange(
                "object instance has no string representation".to_string(),
            )),
        }
    }

    pub fn as_raw(&self) -> Result<&'a [u8]> {
        match self {
            FieldValue::Raw(b) => Ok(b),
            FieldValue::Str(s) => Ok(s.as_bytes()),
            _ => Err(HfaError::OutOfRange(
                "value has no raw byte representation".to_string(),
            )),
        }
    }
}

/// A value being inserted into a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetSource<'a> {
    Int(i32),
    Double(f64),
    Str(&'a str),
}

impl<'a> SetSource<'a> {
    /// Integer form of the source, with saturating double conversion.
    fn to_int(self) -> Result<i64> {
        match self {
            SetSource::Int(v) => Ok(v as i64),
            SetSource::Double(d) => Ok(utils::double_to_int(d)? as i64),
            SetSource::Str(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| HfaError::OutOfRange(format!("cannot parse {:?} as integer", s))),
        }
    }

    fn to_double(self) -> Result<f64> {
        match self {
            SetSource::Int(v) => Ok(v as f64),
            SetSource::Double(d) => Ok(d),
            SetSource::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| HfaError::OutOfRange(format!("cannot parse {:?} as double", s))),
        }
    }
}

/// Describes one field's shape and codec inside a [`TypeDefinition`]
/// (`super::typedef::TypeDefinition`).
#[derive(Debug, Clone, Default)]
pub struct FieldDescriptor {
    pub name: String,
    /// Nominal element count from the dictionary. For pointer fields the
    /// live count in the data header supersedes this.
    pub item_count: u32,
    pub pointer: Pointer,
    pub item_type: ItemType,
    /// Referenced type name for `o` fields, before resolution.
    pub type_name: Option<String>,
    /// Resolved dictionary handle for the referenced type.
    pub object_type: Option<TypeId>,
    /// Fixed instance size in bytes, or `None` when the size depends on the
    /// data (pointer fields, variable nested types, blobs, or arithmetic
    /// overflow of the nominal size).
    pub byte_size: Option<u32>,
    /// Verbatim inline definition body for `x` fields, kept only so the
    /// dictionary can be re-serialized losslessly.
    inline_src: Option<String>,
}

// -------------------------------------------------------------------------
// Schema text parsing
// -------------------------------------------------------------------------

/// Largest enum name table accepted from dictionary text.
const MAX_ENUM_NAMES: u32 = 100_000;

fn parse_err(detail: &str, input: &str) -> HfaError {
    let head: String = input.chars().take(32).collect();
    HfaError::DictionaryParse(format!("{} near {:?}", detail, head))
}

/// Split a leading decimal number off `input`.
fn split_number(input: &str) -> Result<(u32, &str)> {
    let end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if end == 0 {
        return Err(parse_err("expected number", input));
    }
    let value = input[..end]
        .parse::<u32>()
        .map_err(|_| parse_err("number overflows", input))?;
    Ok((value, &input[end..]))
}

/// Split a comma-terminated token off `input`, consuming the comma.
fn split_comma(input: &str) -> Result<(&str, &str)> {
    let comma = input
        .find(',')
        .ok_or_else(|| parse_err("unterminated name", input))?;
    Ok((&input[..comma], &input[comma + 1..]))
}

fn expect_char(input: &str, ch: char) -> Result<&str> {
    input
        .strip_prefix(ch)
        .ok_or_else(|| parse_err(&format!("expected {:?}", ch), input))
}

/// Skip a brace-delimited body, tracking nesting. Returns (body, rest) with
/// the outer braces stripped from `body`.
fn skip_braced(input: &str) -> Result<(&str, &str)> {
    let inner = expect_char(input, '{')?;
    let mut depth = 1usize;
    for (i, c) in inner.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&inner[..i], &inner[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(parse_err("unterminated inline definition", input))
}

impl FieldDescriptor {
    /// Parse one field specification, returning the descriptor and the
    /// remaining schema text.
    ///
    /// Grammar: `<count>:[*|p]<typechar>[typename,][enumtable]<name>,`.
    ///
    /// # Errors
    /// Any malformed token fails the parse; callers must treat this as a
    /// failed type-definition load, not something to retry.
    pub fn parse(input: &str) -> Result<(FieldDescriptor, &str)> {
        let (item_count, rest) = split_number(input)?;
        let rest = expect_char(rest, ':')?;

        let (pointer, rest) = match rest.as_bytes().first() {
            Some(b'*') => (Pointer::Indirect, &rest[1..]),
            Some(b'p') => (Pointer::Optional, &rest[1..]),
            _ => (Pointer::None, rest),
        };

        let type_char = rest
            .chars()
            .next()
            .ok_or_else(|| parse_err("missing item type", rest))?;
        let rest = &rest[type_char.len_utf8()..];

        let mut type_name = None;
        let mut inline_src = None;
        let (item_type, rest) = match type_char {
            '1' => (ItemType::U1, rest),
            '2' => (ItemType::U2, rest),
            '4' => (ItemType::U4, rest),
            'c' => (ItemType::UChar, rest),
            'C' => (ItemType::Char, rest),
            's' => (ItemType::U16, rest),
            'S' => (ItemType::S16, rest),
            't' => (ItemType::Time, rest),
            'l' => (ItemType::U32, rest),
            'L' => (ItemType::S32, rest),
            'f' => (ItemType::F32, rest),
            'd' => (ItemType::F64, rest),
            'm' => (ItemType::C64, rest),
            'M' => (ItemType::C128, rest),
            'b' => (ItemType::Basedata, rest),
            'e' => {
                let (count, rest) = split_number(rest)?;
                if count > MAX_ENUM_NAMES {
                    return Err(parse_err("enum name count out of range", input));
                }
                let mut rest = expect_char(rest, ':')?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (name, tail) = split_comma(rest)?;
                    names.push(name.to_string());
                    rest = tail;
                }
                (ItemType::Enum(names), rest)
            }
            'o' => {
                let (name, rest) = split_comma(rest)?;
                if name.is_empty() {
                    return Err(parse_err("empty object type name", input));
                }
                type_name = Some(name.to_string());
                (ItemType::Object, rest)
            }
            'x' => {
                // Inline definition: skip the body structurally; the field
                // degrades to an object reference with no resolvable type.
                let (body, rest) = skip_braced(rest)?;
                inline_src = Some(body.to_string());
                (ItemType::Object, rest)
            }
            other => return Err(parse_err(&format!("unknown item type {:?}", other), input)),
        };

        let (name, rest) = split_comma(rest)?;
        if name.is_empty() {
            return Err(parse_err("empty field name", input));
        }

        Ok((
            FieldDescriptor {
                name: name.to_string(),
                item_count,
                pointer,
                item_type,
                type_name,
                object_type: None,
                byte_size: None,
                inline_src,
            },
            rest,
        ))
    }

    /// Serialize this descriptor back into dictionary grammar.
    pub(crate) fn to_text(&self, out: &mut String) {
        out.push_str(&self.item_count.to_string());
        out.push(':');
        match self.pointer {
            Pointer::None => {}
            Pointer::Indirect => out.push('*'),
            Pointer::Optional => out.push('p'),
        }
        match (&self.item_type, &self.inline_src) {
            (ItemType::Object, Some(body)) => {
                out.push('x');
                out.push('{');
                out.push_str(body);
                out.push('}');
            }
            (ItemType::Object, None) => {
                out.push('o');
                if let Some(type_name) = &self.type_name {
                    out.push_str(type_name);
                    out.push(',');
                }
            }
            (ItemType::Enum(names), _) => {
                out.push('e');
                out.push_str(&names.len().to_string());
                out.push(':');
                for name in names {
                    out.push_str(name);
                    out.push(',');
                }
            }
            (other, _) => out.push(other.type_char()),
        }
        out.push_str(&self.name);
        out.push(',');
    }

    // ---------------------------------------------------------------------
    // Size completion
    // ---------------------------------------------------------------------

    pub(crate) fn references_object(&self) -> bool {
        self.item_type == ItemType::Object
    }

    /// Compute `byte_size` given the resolved size of the referenced object
    /// type (`None` when there is no object reference, it is unresolved, or
    /// its size is data-dependent).
    pub(crate) fn compute_byte_size(&mut self, object_size: Option<u32>) {
        let base = match &self.item_type {
            ItemType::Object => object_size.and_then(|s| s.checked_mul(self.item_count)),
            ItemType::Basedata => None,
            t => match t.packed_bits() {
                Some(bits) => self
                    .item_count
                    .checked_mul(bits)
                    .map(|total| total.div_ceil(8)),
                None => t.item_size().and_then(|w| w.checked_mul(self.item_count)),
            },
        };
        self.byte_size = match self.pointer {
            // `p` fields are variable outright: the live count decides.
            Pointer::Optional => None,
            Pointer::Indirect => base.and_then(|b| b.checked_add(POINTER_HEADER_SIZE as u32)),
            Pointer::None => base,
        };
    }

    // ---------------------------------------------------------------------
    // Payload location
    // ---------------------------------------------------------------------

    /// Resolve the payload window of this field: for pointer fields skips the
    /// count/offset header and reports the live count, otherwise the window
    /// itself with the nominal count.
    fn payload<'a>(&self, data: &'a [u8], data_offset: u64) -> Result<(&'a [u8], u64, u32)> {
        match self.pointer {
            Pointer::None => Ok((data, data_offset, self.item_count)),
            _ => {
                utils::window(data, 0, POINTER_HEADER_SIZE, "pointer header")?;
                let count = utils::read_u32(data, 0)?;
                Ok((
                    &data[POINTER_HEADER_SIZE..],
                    data_offset + POINTER_HEADER_SIZE as u64,
                    count,
                ))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Extraction
    // ---------------------------------------------------------------------

    /// Extract the `index`-th element of this field from `data`, delegating
    /// any remaining path segments into a nested object type.
    ///
    /// `data_offset` is the container-file position of `data`, needed to
    /// maintain pointer-field payload offsets.
    pub fn extract<'a>(
        &'a self,
        rest: &[PathSeg],
        index: i32,
        data: &'a [u8],
        data_offset: u64,
        dict: &'a TypeDictionary,
    ) -> Result<FieldValue<'a>> {
        if self.item_type == ItemType::Basedata {
            return self.extract_blob(index, data, data_offset);
        }
        if !rest.is_empty() && self.item_type != ItemType::Object {
            return Err(HfaError::FieldNotFound(format!(
                "field {:?} is not an object, cannot descend into {:?}",
                self.name, rest[0].name
            )));
        }

        let (payload, payload_offset, count) = self.payload(data, data_offset)?;
        let idx = usize::try_from(index).map_err(|_| {
            HfaError::OutOfRange(format!("negative index on field {:?}", self.name))
        })?;
        if self.pointer != Pointer::None && idx >= count as usize {
            return Err(HfaError::Bounds {
                context: "pointer element index",
                needed: idx + 1,
                available: count as usize,
            });
        }

        match &self.item_type {
            ItemType::Object => {
                let ty = self.resolved_type(dict)?;
                let offset = self.locate_instance(ty, payload, idx, dict)?;
                if rest.is_empty() {
                    let len = ty.instance_byte_length(&payload[offset..], dict)?;
                    return Ok(FieldValue::Raw(utils::window(
                        payload,
                        offset,
                        len,
                        "object instance",
                    )?));
                }
                ty.extract_value(
                    rest,
                    &payload[offset..],
                    payload_offset + offset as u64,
                    dict,
                )
            }
            ItemType::UChar | ItemType::Char => {
                let limit = if self.pointer == Pointer::None {
                    (self.item_count as usize).min(payload.len())
                } else {
                    (count as usize).min(payload.len())
                };
                let window = utils::window(payload, idx, limit.saturating_sub(idx), "char array")?;
                let end = window.iter().position(|&b| b == 0).unwrap_or(window.len());
                let text = std::str::from_utf8(&window[..end]).map_err(|_| {
                    HfaError::InvalidFormat(format!("field {:?} holds non-ASCII text", self.name))
                })?;
                Ok(FieldValue::Str(text))
            }
            ItemType::Enum(names) => {
                let value = utils::read_u16(payload, idx * 2)?;
                Ok(FieldValue::Enum {
                    value,
                    name: names.get(value as usize).map(String::as_str),
                })
            }
            t @ (ItemType::U1 | ItemType::U2 | ItemType::U4) => {
                let bits = match t {
                    ItemType::U1 => 1,
                    ItemType::U2 => 2,
                    _ => 4,
                };
                Ok(FieldValue::Int(read_packed(payload, idx, bits)? as i64))
            }
            ItemType::U16 => Ok(FieldValue::Int(utils::read_u16(payload, idx * 2)? as i64)),
            ItemType::S16 => Ok(FieldValue::Int(utils::read_i16(payload, idx * 2)? as i64)),
            ItemType::Time | ItemType::U32 => {
                Ok(FieldValue::Int(utils::read_u32(payload, idx * 4)? as i64))
            }
            ItemType::S32 => Ok(FieldValue::Int(utils::read_i32(payload, idx * 4)? as i64)),
            ItemType::F32 => Ok(FieldValue::Double(utils::read_f32(payload, idx * 4)? as f64)),
            ItemType::F64 => Ok(FieldValue::Double(utils::read_f64(payload, idx * 8)?)),
            // Complex kinds surface their real component.
            ItemType::C64 => Ok(FieldValue::Double(utils::read_f32(payload, idx * 8)? as f64)),
            ItemType::C128 => Ok(FieldValue::Double(utils::read_f64(payload, idx * 16)?)),
            ItemType::Basedata => unreachable!("handled above"),
        }
    }

    fn resolved_type<'a>(&self, dict: &'a TypeDictionary) -> Result<&'a super::typedef::TypeDefinition> {
        let id = self.object_type.ok_or_else(|| {
            HfaError::UnknownType(
                self.type_name
                    .clone()
                    .unwrap_or_else(|| format!("<inline type of field {}>", self.name)),
            )
        })?;
        Ok(dict.get(id))
    }

    /// Byte offset of the `idx`-th object instance inside the payload.
    fn locate_instance(
        &self,
        ty: &super::typedef::TypeDefinition,
        payload: &[u8],
        idx: usize,
        dict: &TypeDictionary,
    ) -> Result<usize> {
        match ty.fixed_size() {
            Some(size) => idx.checked_mul(size).ok_or(HfaError::Bounds {
                context: "object instance offset",
                needed: usize::MAX,
                available: payload.len(),
            }),
            None => {
                // Variable-size instances: walk forward one at a time.
                let mut offset = 0usize;
                for _ in 0..idx {
                    let len = ty.instance_byte_length(&payload[offset.min(payload.len())..], dict)?;
                    offset = offset.checked_add(len).ok_or(HfaError::Bounds {
                        context: "object instance walk",
                        needed: usize::MAX,
                        available: payload.len(),
                    })?;
                    if offset > payload.len() {
                        return Err(HfaError::Bounds {
                            context: "object instance walk",
                            needed: offset,
                            available: payload.len(),
                        });
                    }
                }
                Ok(offset)
            }
        }
    }

    /// Blob extraction, including the -1/-2/-3 pseudo-indices that address
    /// the sub-header itself.
    fn extract_blob<'a>(
        &'a self,
        index: i32,
        data: &'a [u8],
        data_offset: u64,
    ) -> Result<FieldValue<'a>> {
        let (payload, _, _) = self.payload(data, data_offset)?;
        utils::window(payload, 0, BLOB_HEADER_SIZE, "blob header")?;
        let rows = utils::read_i32(payload, 0)?;
        let cols = utils::read_i32(payload, 4)?;
        let code = utils::read_u16(payload, 8)?;
        match index {
            -1 => Ok(FieldValue::Int(rows as i64)),
            -2 => Ok(FieldValue::Int(cols as i64)),
            -3 => Ok(FieldValue::Int(code as i64)),
            idx if idx >= 0 => {
                let sample_type = SampleType::try_from(code)?;
                let idx = idx as usize;
                let total = (rows as i64).checked_mul(cols as i64).filter(|&n| n >= 0).ok_or_else(
                    || HfaError::InvalidFormat("blob sample count overflows".to_string()),
                )?;
                if idx as i64 >= total {
                    return Err(HfaError::Bounds {
                        context: "blob sample index",
                        needed: idx + 1,
                        available: total as usize,
                    });
                }
                let samples = &payload[BLOB_HEADER_SIZE..];
                match sample_type {
                    SampleType::U1 => Ok(FieldValue::Int(read_packed(samples, idx, 1)? as i64)),
                    SampleType::U2 => Ok(FieldValue::Int(read_packed(samples, idx, 2)? as i64)),
                    SampleType::U4 => Ok(FieldValue::Int(read_packed(samples, idx, 4)? as i64)),
                    SampleType::U8 => Ok(FieldValue::Int(utils::read_u8(samples, idx)? as i64)),
                    SampleType::S8 => {
                        Ok(FieldValue::Int(utils::read_u8(samples, idx)? as i8 as i64))
                    }
                    SampleType::U16 => Ok(FieldValue::Int(utils::read_u16(samples, idx * 2)? as i64)),
                    SampleType::S16 => Ok(FieldValue::Int(utils::read_i16(samples, idx * 2)? as i64)),
                    SampleType::U32 => Ok(FieldValue::Int(utils::read_u32(samples, idx * 4)? as i64)),
                    SampleType::S32 => Ok(FieldValue::Int(utils::read_i32(samples, idx * 4)? as i64)),
                    SampleType::F32 => {
                        Ok(FieldValue::Double(utils::read_f32(samples, idx * 4)? as f64))
                    }
                    SampleType::F64 => Ok(FieldValue::Double(utils::read_f64(samples, idx * 8)?)),
                }
            }
            _ => Err(HfaError::OutOfRange(format!(
                "blob pseudo-index {} not in -1..=-3",
                index
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Insertion
    // ---------------------------------------------------------------------

    /// Insert `value` as the `index`-th element of this field in `data`,
    /// delegating remaining path segments into a nested object type.
    pub fn set(
        &self,
        rest: &[PathSeg],
        index: i32,
        data: &mut [u8],
        data_offset: u64,
        dict: &TypeDictionary,
        value: SetSource,
    ) -> Result<()> {
        if self.item_type == ItemType::Basedata {
            return self.set_blob(index, data, data_offset, value);
        }
        if !rest.is_empty() && self.item_type != ItemType::Object {
            return Err(HfaError::FieldNotFound(format!(
                "field {:?} is not an object, cannot descend into {:?}",
                self.name, rest[0].name
            )));
        }

        let idx = usize::try_from(index).map_err(|_| {
            HfaError::OutOfRange(format!("negative index on field {:?}", self.name))
        })?;

        match &self.item_type {
            ItemType::UChar | ItemType::Char => {
                let text = match value {
                    SetSource::Str(s) => s.to_string(),
                    SetSource::Int(v) => v.to_string(),
                    SetSource::Double(d) => d.to_string(),
                };
                self.set_string(&text, data, data_offset)
            }
            ItemType::Object => {
                // Descending into an instance never changes the element
                // count; the header is read, not maintained.
                let (payload_start, count) = match self.pointer {
                    Pointer::None => (0usize, self.item_count),
                    _ => {
                        utils::window(data, 0, POINTER_HEADER_SIZE, "pointer header")?;
                        (POINTER_HEADER_SIZE, utils::read_u32(data, 0)?)
                    }
                };
                let ty = self.resolved_type(dict)?;
                if idx >= count as usize {
                    return Err(HfaError::Bounds {
                        context: "object element index",
                        needed: idx + 1,
                        available: count as usize,
                    });
                }
                let offset = self.locate_instance(ty, &data[payload_start..], idx, dict)?;
                ty.set_value(
                    rest,
                    &mut data[payload_start + offset..],
                    data_offset + (payload_start + offset) as u64,
                    dict,
                    value,
                )
            }
            ItemType::Enum(names) => {
                let stored: u16 = match value {
                    SetSource::Str(s) => names
                        .iter()
                        .position(|n| n == s)
                        .ok_or_else(|| HfaError::UnknownEnumName {
                            name: s.to_string(),
                            field: self.name.clone(),
                        })? as u16,
                    other => {
                        let v = other.to_int()?;
                        u16::try_from(v).map_err(|_| {
                            HfaError::OutOfRange(format!("enum value {} out of range", v))
                        })?
                    }
                };
                let start = self.prepare_numeric(data, data_offset, idx, 2)?;
                utils::write_u16(&mut data[start..], idx * 2, stored)
            }
            t @ (ItemType::U1 | ItemType::U2 | ItemType::U4) => {
                let bits = match t {
                    ItemType::U1 => 1,
                    ItemType::U2 => 2,
                    _ => 4,
                };
                let v = value.to_int()?;
                let max = (1u32 << bits) - 1;
                if v < 0 || v as u64 > max as u64 {
                    return Err(HfaError::OutOfRange(format!(
                        "value {} does not fit in {} bits",
                        v, bits
                    )));
                }
                let start = self.prepare_packed(data, data_offset, idx, bits)?;
                write_packed(&mut data[start..], idx, bits, v as u32)
            }
            ItemType::U16 => {
                let v = value.to_int()?;
                let start = self.prepare_numeric(data, data_offset, idx, 2)?;
                utils::write_u16(&mut data[start..], idx * 2, v as u16)
            }
            ItemType::S16 => {
                let v = value.to_int()?;
                let start = self.prepare_numeric(data, data_offset, idx, 2)?;
                utils::write_i16(&mut data[start..], idx * 2, v as i16)
            }
            ItemType::Time | ItemType::U32 => {
                let v = value.to_int()?;
                let start = self.prepare_numeric(data, data_offset, idx, 4)?;
                utils::write_u32(&mut data[start..], idx * 4, v as u32)
            }
            ItemType::S32 => {
                let v = value.to_int()?;
                let start = self.prepare_numeric(data, data_offset, idx, 4)?;
                utils::write_i32(&mut data[start..], idx * 4, v as i32)
            }
            ItemType::F32 => {
                let v = value.to_double()?;
                let start = self.prepare_numeric(data, data_offset, idx, 4)?;
                utils::write_f32(&mut data[start..], idx * 4, v as f32)
            }
            ItemType::F64 => {
                let v = value.to_double()?;
                let start = self.prepare_numeric(data, data_offset, idx, 8)?;
                utils::write_f64(&mut data[start..], idx * 8, v)
            }
            ItemType::C64 => {
                // Real component set, imaginary zeroed.
                let v = value.to_double()?;
                let start = self.prepare_numeric(data, data_offset, idx, 8)?;
                utils::write_f32(&mut data[start..], idx * 8, v as f32)?;
                utils::write_f32(&mut data[start..], idx * 8 + 4, 0.0)
            }
            ItemType::C128 => {
                let v = value.to_double()?;
                let start = self.prepare_numeric(data, data_offset, idx, 16)?;
                utils::write_f64(&mut data[start..], idx * 16, v)?;
                utils::write_f64(&mut data[start..], idx * 16 + 8, 0.0)
            }
            ItemType::Basedata => unreachable!("handled above"),
        }
    }

    /// Prepare a write into a fixed-width element array: maintain the pointer
    /// header (count only ever grows), verify the element bytes fit inside
    /// the window, and return the payload start offset.
    fn prepare_numeric(
        &self,
        data: &mut [u8],
        data_offset: u64,
        idx: usize,
        width: usize,
    ) -> Result<usize> {
        let needed_bytes = idx
            .checked_add(1)
            .and_then(|n| n.checked_mul(width))
            .ok_or(HfaError::OutOfRange("element offset overflows".to_string()))?;
        let (start, _) = self.prepare_payload(data, data_offset, idx + 1, Some(needed_bytes))?;
        utils::window(data, start, needed_bytes, "element write").map_err(|_| {
            HfaError::WriteCapacity {
                context: "element write",
                needed: start + needed_bytes,
                available: data.len(),
            }
        })?;
        Ok(start)
    }

    fn prepare_packed(
        &self,
        data: &mut [u8],
        data_offset: u64,
        idx: usize,
        bits: usize,
    ) -> Result<usize> {
        let needed_bytes = idx
            .checked_add(1)
            .and_then(|n| n.checked_mul(bits))
            .map(|total| total.div_ceil(8))
            .ok_or(HfaError::OutOfRange("bit offset overflows".to_string()))?;
        let (start, _) = self.prepare_payload(data, data_offset, idx + 1, Some(needed_bytes))?;
        utils::window(data, start, needed_bytes, "packed write").map_err(|_| {
            HfaError::WriteCapacity {
                context: "packed write",
                needed: start + needed_bytes,
                available: data.len(),
            }
        })?;
        Ok(start)
    }

    /// Maintain the pointer header for a write reaching `needed_count`
    /// elements / `needed_bytes` payload bytes. The stored count is only
    /// ever increased; growing past the window is a capacity failure.
    /// Returns (payload start, live count after update).
    fn prepare_payload(
        &self,
        data: &mut [u8],
        data_offset: u64,
        needed_count: usize,
        needed_bytes: Option<usize>,
    ) -> Result<(usize, u32)> {
        match self.pointer {
            Pointer::None => Ok((0, self.item_count)),
            _ => {
                utils::window(data, 0, POINTER_HEADER_SIZE, "pointer header")?;
                let stored = utils::read_u32(data, 0)?;
                let needed_count = u32::try_from(needed_count).map_err(|_| {
                    HfaError::OutOfRange("element count overflows".to_string())
                })?;
                let new_count = stored.max(needed_count);
                if let Some(bytes) = needed_bytes {
                    let total = bytes.checked_add(POINTER_HEADER_SIZE).ok_or(
                        HfaError::OutOfRange("payload size overflows".to_string()),
                    )?;
                    if total > data.len() {
                        return Err(HfaError::WriteCapacity {
                            context: "pointer array growth",
                            needed: total,
                            available: data.len(),
                        });
                    }
                }
                if new_count != stored {
                    utils::write_u32(data, 0, new_count)?;
                    utils::write_u32(data, 4, (data_offset + POINTER_HEADER_SIZE as u64) as u32)?;
                }
                Ok((POINTER_HEADER_SIZE, new_count))
            }
        }
    }

    /// Write a character string: zero-pad the available window, then copy,
    /// failing when the string plus terminator does not fit.
    fn set_string(&self, text: &str, data: &mut [u8], data_offset: u64) -> Result<()> {
        let needed = text.len() + 1;
        match self.pointer {
            Pointer::None => {
                let capacity = (self.item_count as usize).min(data.len());
                if needed > capacity {
                    return Err(HfaError::WriteCapacity {
                        context: "string write",
                        needed,
                        available: capacity,
                    });
                }
                data[..capacity].fill(0);
                data[..text.len()].copy_from_slice(text.as_bytes());
                Ok(())
            }
            _ => {
                let (start, count) = self.prepare_payload(data, data_offset, needed, Some(needed))?;
                // Pad only this field's payload; bytes past the live count
                // belong to whatever follows in the instance.
                let end = start.saturating_add(count as usize).min(data.len());
                data[start..end].fill(0);
                data[start..start + text.len()].copy_from_slice(text.as_bytes());
                Ok(())
            }
        }
    }

    /// Blob insertion. Pseudo-indices redefine the blob shape in place; only
    /// unsigned-byte and 64-bit float sample types accept sample writes.
    fn set_blob(
        &self,
        index: i32,
        data: &mut [u8],
        data_offset: u64,
        value: SetSource,
    ) -> Result<()> {
        let header = match self.pointer {
            Pointer::None => 0usize,
            _ => {
                // Blob writes do not change the element count; just ensure
                // the header is present.
                utils::window(data, 0, POINTER_HEADER_SIZE, "pointer header")?;
                POINTER_HEADER_SIZE
            }
        };
        let _ = data_offset;
        utils::window(data, header, BLOB_HEADER_SIZE, "blob header")?;
        match index {
            -1 => {
                let v = value.to_int()? as i32;
                utils::write_i32(data, header, v)
            }
            -2 => {
                let v = value.to_int()? as i32;
                utils::write_i32(data, header + 4, v)
            }
            -3 => {
                let v = value.to_int()?;
                let code = u16::try_from(v).map_err(|_| {
                    HfaError::OutOfRange(format!("sample type code {} out of range", v))
                })?;
                utils::write_u16(data, header + 8, code)
            }
            idx if idx >= 0 => {
                let rows = utils::read_i32(data, header)?;
                let cols = utils::read_i32(data, header + 4)?;
                let code = utils::read_u16(data, header + 8)?;
                let sample_type = SampleType::try_from(code)?;
                let idx = idx as usize;
                let total = (rows as i64).checked_mul(cols as i64).filter(|&n| n >= 0).ok_or_else(
                    || HfaError::InvalidFormat("blob sample count overflows".to_string()),
                )?;
                if idx as i64 >= total {
                    return Err(HfaError::Bounds {
                        context: "blob sample index",
                        needed: idx + 1,
                        available: total as usize,
                    });
                }
                let samples = header + BLOB_HEADER_SIZE;
                match sample_type {
                    SampleType::U8 => {
                        let v = value.to_int()?;
                        let v = v.clamp(0, u8::MAX as i64) as u8;
                        utils::write_u8(data, samples + idx, v)
                    }
                    SampleType::F64 => {
                        let v = value.to_double()?;
                        utils::write_f64(data, samples + idx * 8, v)
                    }
                    other => Err(HfaError::UnsupportedSampleType(other.code())),
                }
            }
            _ => Err(HfaError::OutOfRange(format!(
                "blob pseudo-index {} not in -1..=-3",
                index
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Instance sizing
    // ---------------------------------------------------------------------

    /// Live element count of this field in `data`: the pointer-header count
    /// for pointer fields, rows × columns for blobs, the nominal count
    /// otherwise.
    pub fn instance_count(&self, data: &[u8]) -> Result<u32> {
        if self.item_type == ItemType::Basedata {
            let header = match self.pointer {
                Pointer::None => 0usize,
                _ => POINTER_HEADER_SIZE,
            };
            let rows = utils::read_i32(data, header)?;
            let cols = utils::read_i32(data, header + 4)?;
            let total = (rows as i64).checked_mul(cols as i64).filter(|&n| n >= 0).ok_or_else(
                || HfaError::InvalidFormat("blob sample count overflows".to_string()),
            )?;
            return u32::try_from(total)
                .map_err(|_| HfaError::InvalidFormat("blob sample count overflows".to_string()));
        }
        match self.pointer {
            Pointer::None => Ok(self.item_count),
            _ => utils::read_u32(data, 0),
        }
    }

    /// Bytes occupied by one instance of this field in `data`.
    ///
    /// Fixed-size fields return the precomputed size; pointer and blob
    /// fields read the live shape out of the data, recursing through nested
    /// objects as needed. Any overflow or truncation is a failure.
    pub fn instance_byte_length(&self, data: &[u8], dict: &TypeDictionary) -> Result<usize> {
        if let Some(size) = self.byte_size {
            return Ok(size as usize);
        }

        let (header, count) = match self.pointer {
            Pointer::None => (0usize, self.item_count),
            _ => {
                utils::window(data, 0, POINTER_HEADER_SIZE, "pointer header")?;
                (POINTER_HEADER_SIZE, utils::read_u32(data, 0)?)
            }
        };

        let body_len: usize = match &self.item_type {
            ItemType::Basedata => {
                if count == 0 && self.pointer != Pointer::None {
                    0
                } else {
                    blob_byte_length(&data[header..])?
                }
            }
            ItemType::Object => {
                let ty = self.resolved_type(dict)?;
                match ty.fixed_size() {
                    Some(size) => (count as usize).checked_mul(size).ok_or(HfaError::Bounds {
                        context: "object array length",
                        needed: usize::MAX,
                        available: data.len(),
                    })?,
                    None => {
                        let payload = &data[header.min(data.len())..];
                        let mut offset = 0usize;
                        for _ in 0..count {
                            if offset > payload.len() {
                                return Err(HfaError::Bounds {
                                    context: "object array walk",
                                    needed: offset,
                                    available: payload.len(),
                                });
                            }
                            let len = ty.instance_byte_length(&payload[offset..], dict)?;
                            offset = offset.checked_add(len).ok_or(HfaError::Bounds {
                                context: "object array walk",
                                needed: usize::MAX,
                                available: payload.len(),
                            })?;
                        }
                        offset
                    }
                }
            }
            t => match t.packed_bits() {
                Some(bits) => (count as usize)
                    .checked_mul(bits as usize)
                    .map(|total| total.div_ceil(8))
                    .ok_or(HfaError::Bounds {
                        context: "packed array length",
                        needed: usize::MAX,
                        available: data.len(),
                    })?,
                None => {
                    let width = t.item_size().unwrap_or_else(|| {
                        warn!("field {:?} has no intrinsic width", self.name);
                        0
                    }) as usize;
                    (count as usize).checked_mul(width).ok_or(HfaError::Bounds {
                        context: "array length",
                        needed: usize::MAX,
                        available: data.len(),
                    })?
                }
            },
        };

        header.checked_add(body_len).ok_or(HfaError::Bounds {
            context: "instance length",
            needed: usize::MAX,
            available: data.len(),
        })
    }
}

/// Total bytes of a blob starting at its sub-header.
fn blob_byte_length(data: &[u8]) -> Result<usize> {
    utils::window(data, 0, BLOB_HEADER_SIZE, "blob header")?;
    let rows = utils::read_i32(data, 0)?;
    let cols = utils::read_i32(data, 4)?;
    let code = utils::read_u16(data, 8)?;
    if rows < 0 || cols < 0 {
        return Err(HfaError::InvalidFormat(format!(
            "blob shape {}x{} is negative",
            rows, cols
        )));
    }
    let sample_type = SampleType::try_from(code)?;
    (rows as usize)
        .checked_mul(cols as usize)
        .and_then(|n| n.checked_mul(sample_type.bits() as usize))
        .map(|bits| bits.div_ceil(8))
        .and_then(|bytes| bytes.checked_add(BLOB_HEADER_SIZE))
        .ok_or(HfaError::Bounds {
            context: "blob length",
            needed: usize::MAX,
            available: data.len(),
        })
}

/// Read the `idx`-th sub-byte element of `bits` width from a packed array.
fn read_packed(data: &[u8], idx: usize, bits: usize) -> Result<u32> {
    let bit = idx
        .checked_mul(bits)
        .ok_or(HfaError::OutOfRange("bit offset overflows".to_string()))?;
    let byte = utils::read_u8(data, bit / 8)?;
    let shift = bit % 8;
    let mask = ((1u16 << bits) - 1) as u8;
    Ok(((byte >> shift) & mask) as u32)
}

/// Write the `idx`-th sub-byte element, leaving neighboring bits untouched.
fn write_packed(data: &mut [u8], idx: usize, bits: usize, value: u32) -> Result<()> {
    let bit = idx
        .checked_mul(bits)
        .ok_or(HfaError::OutOfRange("bit offset overflows".to_string()))?;
    let byte = utils::read_u8(data, bit / 8)?;
    let shift = bit % 8;
    let mask = (((1u16 << bits) - 1) as u8) << shift;
    let updated = (byte & !mask) | (((value as u8) << shift) & mask);
    utils::write_u8(data, bit / 8, updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(text: &str) -> FieldDescriptor {
        let (field, rest) = FieldDescriptor::parse(text).unwrap();
        assert!(rest.is_empty(), "unconsumed input: {:?}", rest);
        field
    }

    #[test]
    fn parses_simple_numeric_field() {
        let f = parse_one("1:lwidth,");
        assert_eq!(f.name, "width");
        assert_eq!(f.item_count, 1);
        assert_eq!(f.pointer, Pointer::None);
        assert_eq!(f.item_type, ItemType::U32);
    }

    #[test]
    fn parses_pointer_modifiers() {
        let f = parse_one("0:pcstring,");
        assert_eq!(f.pointer, Pointer::Optional);
        assert_eq!(f.item_type, ItemType::UChar);
        let f = parse_one("1:*bvalueBD,");
        assert_eq!(f.pointer, Pointer::Indirect);
        assert_eq!(f.item_type, ItemType::Basedata);
    }

    #[test]
    fn parses_enum_with_name_table() {
        let f = parse_one("1:e3:thematic,athematic,fft,layerType,");
        assert_eq!(f.name, "layerType");
        match &f.item_type {
            ItemType::Enum(names) => {
                assert_eq!(names, &["thematic", "athematic", "fft"]);
            }
            other => panic!("expected enum, got {:?}", other),
        }
    }

    #[test]
    fn parses_object_reference() {
        let f = parse_one("2:oEprj_Size,pixelSize,");
        assert_eq!(f.item_type, ItemType::Object);
        assert_eq!(f.type_name.as_deref(), Some("Eprj_Size"));
        assert_eq!(f.item_count, 2);
    }

    #[test]
    fn inline_definition_degrades_to_object() {
        let (f, rest) = FieldDescriptor::parse("1:x{1:lvalue,}holder,1:lnext,").unwrap();
        assert_eq!(f.item_type, ItemType::Object);
        assert_eq!(f.name, "holder");
        assert!(f.type_name.is_none());
        assert_eq!(rest, "1:lnext,");
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(FieldDescriptor::parse("x:lwidth,").is_err());
        assert!(FieldDescriptor::parse("1:qwidth,").is_err());
        assert!(FieldDescriptor::parse("1:lwidth").is_err());
        assert!(FieldDescriptor::parse("1:e200000:a,b,name,").is_err());
        assert!(FieldDescriptor::parse("1:x{1:lvalue,name,").is_err());
    }

    #[test]
    fn byte_size_completion_rules() {
        let mut f = parse_one("10:cname,");
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, Some(10));

        // Packed sub-byte arrays round up whole bytes.
        let mut f = parse_one("10:1flags,");
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, Some(2));

        // `p` is variable outright.
        let mut f = parse_one("1:pdvalues,");
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, None);

        // `*` charges the 8-byte header when the base is known.
        let mut f = parse_one("4:*lvalues,");
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, Some(24));

        // Known object type size multiplies.
        let mut f = parse_one("3:oEprj_Size,sizes,");
        f.compute_byte_size(Some(16));
        assert_eq!(f.byte_size, Some(48));
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, None);

        // Overflow collapses to variable.
        let mut f = parse_one("4294967295:dbig,");
        f.compute_byte_size(None);
        assert_eq!(f.byte_size, None);
    }

    #[test]
    fn field_round_trips_to_text() {
        for spec in [
            "1:lwidth,",
            "0:pcstring,",
            "1:e2:no,yes,flag,",
            "2:oEprj_Size,pixelSize,",
            "1:*bvalueBD,",
        ] {
            let f = parse_one(spec);
            let mut out = String::new();
            f.to_text(&mut out);
            assert_eq!(out, spec);
        }
    }

    #[test]
    fn packed_bits_preserve_neighbors() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("8:2codes,");
        f.compute_byte_size(None);
        let mut data = vec![0u8; 2];
        for i in 0..8 {
            f.set(&[], i as i32, &mut data, 0, &dict, SetSource::Int((i % 4) as i32))
                .unwrap();
        }
        for i in 0..8 {
            let v = f.extract(&[], i as i32, &data, 0, &dict).unwrap();
            assert_eq!(v.as_int().unwrap(), (i % 4) as i32, "element {}", i);
        }
        // Overwrite one element; neighbors must be unchanged.
        f.set(&[], 3, &mut data, 0, &dict, SetSource::Int(0)).unwrap();
        for i in 0..8 {
            let expect = if i == 3 { 0 } else { (i % 4) as i32 };
            let v = f.extract(&[], i as i32, &data, 0, &dict).unwrap();
            assert_eq!(v.as_int().unwrap(), expect, "element {}", i);
        }
        assert!(f
            .set(&[], 0, &mut data, 0, &dict, SetSource::Int(4))
            .is_err());
    }

    #[test]
    fn pointer_count_grows_but_never_past_window() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("1:*lvalues,");
        f.compute_byte_size(None);
        // Room for the header plus 4 elements.
        let mut data = vec![0u8; 8 + 16];
        f.set(&[], 2, &mut data, 100, &dict, SetSource::Int(7)).unwrap();
        assert_eq!(utils::read_u32(&data, 0).unwrap(), 3);
        assert_eq!(utils::read_u32(&data, 4).unwrap(), 108);
        // Writing a lower index must not shrink the stored count.
        f.set(&[], 0, &mut data, 100, &dict, SetSource::Int(1)).unwrap();
        assert_eq!(utils::read_u32(&data, 0).unwrap(), 3);
        // Growing past the window is a capacity failure, leaving count as-is.
        let err = f.set(&[], 4, &mut data, 100, &dict, SetSource::Int(9));
        assert!(matches!(err, Err(HfaError::WriteCapacity { .. })));
        assert_eq!(utils::read_u32(&data, 0).unwrap(), 3);
        // Reads are bounded by the live count.
        assert_eq!(
            f.extract(&[], 2, &data, 100, &dict).unwrap().as_int().unwrap(),
            7
        );
        assert!(f.extract(&[], 3, &data, 100, &dict).is_err());
    }

    #[test]
    fn enum_maps_between_value_and_name() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("1:e3:off,on,auto,mode,");
        f.compute_byte_size(None);
        let mut data = vec![0u8; 2];
        f.set(&[], 0, &mut data, 0, &dict, SetSource::Str("auto")).unwrap();
        let v = f.extract(&[], 0, &data, 0, &dict).unwrap();
        assert_eq!(v.as_int().unwrap(), 2);
        assert_eq!(v.into_string().unwrap(), "auto");
        assert!(matches!(
            f.set(&[], 0, &mut data, 0, &dict, SetSource::Str("bogus")),
            Err(HfaError::UnknownEnumName { .. })
        ));
    }

    #[test]
    fn string_fields_zero_pad_and_check_fit() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("8:cname,");
        f.compute_byte_size(None);
        let mut data = vec![0xAAu8; 8];
        f.set(&[], 0, &mut data, 0, &dict, SetSource::Str("abc")).unwrap();
        assert_eq!(&data, &[b'a', b'b', b'c', 0, 0, 0, 0, 0]);
        assert_eq!(
            f.extract(&[], 0, &data, 0, &dict)
                .unwrap()
                .into_string()
                .unwrap(),
            "abc"
        );
        // Terminator must fit too.
        assert!(f
            .set(&[], 0, &mut data, 0, &dict, SetSource::Str("12345678"))
            .is_err());
    }

    #[test]
    fn pointer_string_write_leaves_following_field_intact() {
        let dict = TypeDictionary::parse("{0:pcname,1:ltail,}Holder,.").unwrap();
        let holder = dict.get(dict.find_by_name("Holder").unwrap());
        let name = [PathSeg { name: "name".into(), index: 0 }];
        let tail = [PathSeg { name: "tail".into(), index: 0 }];
        // Pointer header, 8 live payload bytes, then the tail field.
        let mut data = vec![0u8; 20];
        utils::write_u32(&mut data, 0, 8).unwrap();
        holder.set_value(&tail, &mut data, 0, &dict, SetSource::Int(7)).unwrap();
        holder.set_value(&name, &mut data, 0, &dict, SetSource::Str("ab")).unwrap();
        assert_eq!(
            holder
                .extract_value(&name, &data, 0, &dict)
                .unwrap()
                .into_string()
                .unwrap(),
            "ab"
        );
        // Zero-padding stops at the string's own payload.
        assert_eq!(
            holder.extract_value(&tail, &data, 0, &dict).unwrap().as_int().unwrap(),
            7
        );
    }

    #[test]
    fn double_sets_saturate_into_int_fields() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("1:Lvalue,");
        f.compute_byte_size(None);
        let mut data = vec![0u8; 4];
        f.set(&[], 0, &mut data, 0, &dict, SetSource::Double(1e300)).unwrap();
        assert_eq!(
            f.extract(&[], 0, &data, 0, &dict).unwrap().as_int().unwrap(),
            i32::MAX
        );
        f.set(&[], 0, &mut data, 0, &dict, SetSource::Double(-1e300)).unwrap();
        assert_eq!(
            f.extract(&[], 0, &data, 0, &dict).unwrap().as_int().unwrap(),
            i32::MIN
        );
        assert!(f
            .set(&[], 0, &mut data, 0, &dict, SetSource::Double(f64::NAN))
            .is_err());
    }

    #[test]
    fn non_finite_read_rejected_as_int() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("1:dvalue,");
        f.compute_byte_size(None);
        let mut data = vec![0u8; 8];
        utils::write_f64(&mut data, 0, f64::INFINITY).unwrap();
        let v = f.extract(&[], 0, &data, 0, &dict).unwrap();
        assert!(v.as_int().is_err());
        assert_eq!(v.as_double().unwrap(), f64::INFINITY);
    }

    #[test]
    fn blob_pseudo_indices_redefine_shape() {
        let dict = TypeDictionary::empty();
        let mut f = parse_one("1:*bvalueBD,");
        f.compute_byte_size(None);
        // Pointer header + blob header + 4 f64 samples.
        let mut data = vec![0u8; 8 + 12 + 32];
        utils::write_u32(&mut data, 0, 1).unwrap();
        f.set(&[], -1, &mut data, 0, &dict, SetSource::Int(2)).unwrap();
        f.set(&[], -2, &mut data, 0, &dict, SetSource::Int(2)).unwrap();
        f.set(&[], -3, &mut data, 0, &dict, SetSource::Int(SampleType::F64.code() as i32))
            .unwrap();
        assert_eq!(f.extract(&[], -1, &data, 0, &dict).unwrap().as_int().unwrap(), 2);
        assert_eq!(f.extract(&[], -2, &data, 0, &dict).unwrap().as_int().unwrap(), 2);
        assert_eq!(f.instance_count(&data).unwrap(), 4);

        f.set(&[], 3, &mut data, 0, &dict, SetSource::Double(2.5)).unwrap();
        assert_eq!(
            f.extract(&[], 3, &data, 0, &dict).unwrap().as_double().unwrap(),
            2.5
        );
        assert!(f.extract(&[], 4, &data, 0, &dict).is_err());
        assert_eq!(f.instance_byte_length(&data, &dict).unwrap(), 8 + 12 + 32);

        // Only u8 and f64 samples are writable.
        f.set(&[], -3, &mut data, 0, &dict, SetSource::Int(SampleType::S16.code() as i32))
            .unwrap();
        assert!(matches!(
            f.set(&[], 0, &mut data, 0, &dict, SetSource::Int(1)),
            Err(HfaError::UnsupportedSampleType(_))
        ));
    }
}
