//! Field path parsing.
//!
//! Accessors address fields with dotted paths such as
//! `"blockinfo[2].offset"`. The path is parsed once into a [`FieldPath`] and
//! the structured form is walked from then on; callers doing bulk access can
//! pre-parse a path and reuse it across a loop.

use super::error::{HfaError, Result};

/// One segment of a field path: a field name with an optional element index.
///
/// The index defaults to 0 when no `[n]` suffix is present. Negative indices
/// are legal only on raster-sample blob fields, where -1/-2/-3 address the
/// row count, column count, and sample-type code of the blob sub-header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSeg {
    pub name: String,
    pub index: i32,
}

/// A parsed field path: an ordered list of name/index segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<PathSeg>,
}

impl FieldPath {
    /// Parse a dotted path with optional `[index]` suffixes on each segment.
    ///
    /// # Errors
    /// Fails on empty segments, unterminated brackets, or non-integer
    /// indices.
    pub fn parse(path: &str) -> Result<FieldPath> {
        let mut segments = Vec::new();
        for part in path.split('.') {
            let (name, index) = match part.find('[') {
                Some(open) => {
                    let close = part.rfind(']').ok_or_else(|| {
                        HfaError::InvalidFormat(format!("unterminated index in path {:?}", path))
                    })?;
                    if close < open {
                        return Err(HfaError::InvalidFormat(format!(
                            "malformed index in path {:?}",
                            path
                        )));
                    }
                    let index = part[open + 1..close].parse::<i32>().map_err(|_| {
                        HfaError::InvalidFormat(format!("non-integer index in path {:?}", path))
                    })?;
                    (&part[..open], index)
                }
                None => (part, 0),
            };
            if name.is_empty() {
                return Err(HfaError::InvalidFormat(format!(
                    "empty field name in path {:?}",
                    path
                )));
            }
            segments.push(PathSeg {
                name: name.to_string(),
                index,
            });
        }
        if segments.is_empty() {
            return Err(HfaError::InvalidFormat("empty field path".to_string()));
        }
        Ok(FieldPath { segments })
    }

    pub fn segments(&self) -> &[PathSeg] {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_name() {
        let p = FieldPath::parse("width").unwrap();
        assert_eq!(p.segments(), &[PathSeg { name: "width".into(), index: 0 }]);
    }

    #[test]
    fn parses_nested_with_indices() {
        let p = FieldPath::parse("layer[3].noData[-1]").unwrap();
        assert_eq!(
            p.segments(),
            &[
                PathSeg { name: "layer".into(), index: 3 },
                PathSeg { name: "noData".into(), index: -1 },
            ]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("a[").is_err());
        assert!(FieldPath::parse("a[x]").is_err());
    }
}
