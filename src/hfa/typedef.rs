//! Type definitions: named, ordered lists of field descriptors.

use super::dictionary::TypeDictionary;
use super::error::{HfaError, Result};
use super::field::{FieldDescriptor, FieldValue, SetSource};
use super::path::PathSeg;

/// The computed instance size of a type.
///
/// `Pending` exists only between parsing and the completion pass; a resolved
/// dictionary never exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeState {
    #[default]
    Pending,
    Fixed(u32),
    /// Instance size depends on the data: the type contains pointer fields,
    /// blobs, variable nested types, recursive references, or its nominal
    /// size overflows.
    Variable,
}

/// A named, ordered list of [`FieldDescriptor`]s with a computed instance
/// size.
#[derive(Debug, Clone, Default)]
pub struct TypeDefinition {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub byte_size: SizeState,
}

impl TypeDefinition {
    /// Parse one type block `'{' fieldspec* '}' name ','`, returning the
    /// definition and the remaining schema text.
    pub fn parse(input: &str) -> Result<(TypeDefinition, &str)> {
        let mut rest = input.strip_prefix('{').ok_or_else(|| {
            HfaError::DictionaryParse(format!(
                "expected '{{' near {:?}",
                input.chars().take(32).collect::<String>()
            ))
        })?;
        let mut fields = Vec::new();
        while !rest.starts_with('}') {
            if rest.is_empty() {
                return Err(HfaError::DictionaryParse(
                    "unterminated field list".to_string(),
                ));
            }
            let (field, tail) = FieldDescriptor::parse(rest)?;
            fields.push(field);
            rest = tail;
        }
        let rest = &rest[1..];
        let comma = rest.find(',').ok_or_else(|| {
            HfaError::DictionaryParse("unterminated type name".to_string())
        })?;
        let name = &rest[..comma];
        if name.is_empty() {
            return Err(HfaError::DictionaryParse("empty type name".to_string()));
        }
        Ok((
            TypeDefinition {
                name: name.to_string(),
                fields,
                byte_size: SizeState::Pending,
            },
            &rest[comma + 1..],
        ))
    }

    /// Serialize this definition back into dictionary grammar.
    pub(crate) fn to_text(&self, out: &mut String) {
        out.push('{');
        for field in &self.fields {
            field.to_text(out);
        }
        out.push('}');
        out.push_str(&self.name);
        out.push(',');
    }

    /// Fixed instance size, or `None` when data-dependent.
    pub fn fixed_size(&self) -> Option<usize> {
        match self.byte_size {
            SizeState::Fixed(size) => Some(size as usize),
            _ => None,
        }
    }

    /// Find a field and the byte offset of its first instance within `data`,
    /// accumulating each preceding field's instance length. Name matching is
    /// case-sensitive and exact.
    fn locate_field(
        &self,
        name: &str,
        data: &[u8],
        dict: &TypeDictionary,
    ) -> Result<(&FieldDescriptor, usize)> {
        let mut offset = 0usize;
        for field in &self.fields {
            if field.name == name {
                if offset > data.len() {
                    return Err(HfaError::Bounds {
                        context: "field offset",
                        needed: offset,
                        available: data.len(),
                    });
                }
                return Ok((field, offset));
            }
            offset = offset
                .checked_add(field.instance_byte_length(&data[offset.min(data.len())..], dict)?)
                .ok_or(HfaError::Bounds {
                    context: "field offset",
                    needed: usize::MAX,
                    available: data.len(),
                })?;
            if offset > data.len() {
                return Err(HfaError::Bounds {
                    context: "field offset",
                    needed: offset,
                    available: data.len(),
                });
            }
        }
        Err(HfaError::FieldNotFound(format!(
            "{} has no field {:?}",
            self.name, name
        )))
    }

    /// Extract a value along a parsed field path from an instance of this
    /// type occupying `data` (whose container-file position is
    /// `data_offset`).
    pub fn extract_value<'a>(
        &'a self,
        path: &[PathSeg],
        data: &'a [u8],
        data_offset: u64,
        dict: &'a TypeDictionary,
    ) -> Result<FieldValue<'a>> {
        let seg = path.first().ok_or_else(|| {
            HfaError::FieldNotFound("empty field path".to_string())
        })?;
        let (field, offset) = self.locate_field(&seg.name, data, dict)?;
        field.extract(
            &path[1..],
            seg.index,
            &data[offset..],
            data_offset + offset as u64,
            dict,
        )
    }

    /// Insert a value along a parsed field path. The symmetric counterpart
    /// of [`TypeDefinition::extract_value`].
    pub fn set_value(
        &self,
        path: &[PathSeg],
        data: &mut [u8],
        data_offset: u64,
        dict: &TypeDictionary,
        value: SetSource,
    ) -> Result<()> {
        let seg = path.first().ok_or_else(|| {
            HfaError::FieldNotFound("empty field path".to_string())
        })?;
        let (field, offset) = self.locate_field(&seg.name, data, dict)?;
        field.set(
            &path[1..],
            seg.index,
            &mut data[offset..],
            data_offset + offset as u64,
            dict,
            value,
        )
    }

    /// Live element count of the field a path names.
    pub fn field_count(
        &self,
        path: &[PathSeg],
        data: &[u8],
        dict: &TypeDictionary,
    ) -> Result<u32> {
        let seg = path.first().ok_or_else(|| {
            HfaError::FieldNotFound("empty field path".to_string())
        })?;
        let (field, offset) = self.locate_field(&seg.name, data, dict)?;
        if path.len() > 1 {
            // Descend into the nested instance and continue there.
            let raw = field.extract(&[], seg.index, &data[offset..], 0, dict)?;
            let nested = raw.as_raw()?;
            let ty = field
                .object_type
                .ok_or_else(|| HfaError::UnknownType(seg.name.clone()))?;
            return dict.get(ty).field_count(&path[1..], nested, dict);
        }
        field.instance_count(&data[offset..])
    }

    /// Bytes one instance of this type occupies in `data`.
    pub fn instance_byte_length(&self, data: &[u8], dict: &TypeDictionary) -> Result<usize> {
        if let Some(size) = self.fixed_size() {
            return Ok(size);
        }
        let mut offset = 0usize;
        for field in &self.fields {
            if offset > data.len() {
                return Err(HfaError::Bounds {
                    context: "instance length",
                    needed: offset,
                    available: data.len(),
                });
            }
            offset = offset
                .checked_add(field.instance_byte_length(&data[offset..], dict)?)
                .ok_or(HfaError::Bounds {
                    context: "instance length",
                    needed: usize::MAX,
                    available: data.len(),
                })?;
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_block() {
        let (ty, rest) =
            TypeDefinition::parse("{1:lwidth,1:lheight,1:e2:off,on,state,}Eimg_Size,tail").unwrap();
        assert_eq!(ty.name, "Eimg_Size");
        assert_eq!(ty.fields.len(), 3);
        assert_eq!(ty.fields[0].name, "width");
        assert_eq!(ty.fields[2].name, "state");
        assert_eq!(rest, "tail");
    }

    #[test]
    fn rejects_malformed_type_blocks() {
        assert!(TypeDefinition::parse("1:lwidth,}Name,").is_err());
        assert!(TypeDefinition::parse("{1:lwidth,").is_err());
        assert!(TypeDefinition::parse("{1:lwidth,}").is_err());
        assert!(TypeDefinition::parse("{}  ").is_err());
    }

    #[test]
    fn type_round_trips_to_text() {
        let src = "{1:lwidth,1:lheight,1:e2:off,on,state,}Eimg_Size,";
        let (ty, _) = TypeDefinition::parse(src).unwrap();
        let mut out = String::new();
        ty.to_text(&mut out);
        assert_eq!(out, src);
    }
}
