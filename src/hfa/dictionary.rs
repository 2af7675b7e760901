//! The type dictionary: registry of named type definitions parsed from the
//! schema text embedded in a container.
//!
//! After parsing, a completion pass resolves cross-references between types
//! and computes every type's instance size. Completion carries an explicit
//! visiting set so self-referential or mutually-recursive type graphs finish
//! without looping; a re-entered type's size is simply unknown (variable).

use std::collections::{HashMap, HashSet};
use std::mem;

use log::warn;

use super::error::Result;
use super::typedef::{SizeState, TypeDefinition};

/// Resolved handle to a [`TypeDefinition`] inside its dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) usize);

/// Registry of named type definitions. Built once per container; types can
/// only be added, never removed.
#[derive(Debug, Default)]
pub struct TypeDictionary {
    types: Vec<TypeDefinition>,
    by_name: HashMap<String, TypeId>,
}

impl TypeDictionary {
    /// An empty dictionary. Mainly useful for synthesizing containers from
    /// scratch and for tests.
    pub fn empty() -> TypeDictionary {
        TypeDictionary::default()
    }

    /// Parse a full dictionary text: type blocks until the `.` terminator or
    /// the end of input, then one completion pass over everything.
    ///
    /// # Errors
    /// Any malformed type block fails the whole load; the container cannot
    /// be used without its dictionary.
    pub fn parse(text: &str) -> Result<TypeDictionary> {
        let mut dict = TypeDictionary::default();
        let mut rest = text;
        while !rest.is_empty() && !rest.starts_with('.') {
            let (ty, tail) = TypeDefinition::parse(rest)?;
            dict.register(ty);
            rest = tail;
        }
        dict.complete_all();
        Ok(dict)
    }

    fn register(&mut self, ty: TypeDefinition) -> TypeId {
        let id = TypeId(self.types.len());
        // Registered as parsed; a duplicate name simply rebinds the lookup.
        self.by_name.insert(ty.name.clone(), id);
        self.types.push(ty);
        id
    }

    /// Add a new type during a write session, completing it immediately.
    pub fn add_type(&mut self, ty: TypeDefinition) -> TypeId {
        let id = self.register(ty);
        let mut visiting = HashSet::new();
        self.complete_type(id.0, &mut visiting);
        id
    }

    pub fn find_by_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: TypeId) -> &TypeDefinition {
        &self.types[id.0]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDefinition> {
        self.types.iter()
    }

    /// Serialize the whole dictionary back to schema text, terminator
    /// included.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for ty in &self.types {
            ty.to_text(&mut out);
        }
        out.push('.');
        out
    }

    fn complete_all(&mut self) {
        let mut visiting = HashSet::new();
        for id in 0..self.types.len() {
            self.complete_type(id, &mut visiting);
        }
    }

    /// Complete one type: resolve its fields' object references and compute
    /// its instance size, recursing into referenced types first. A type
    /// found already in `visiting` is part of a cycle and reports a
    /// variable size instead of recursing forever.
    fn complete_type(&mut self, id: usize, visiting: &mut HashSet<usize>) -> SizeState {
        match self.types[id].byte_size {
            SizeState::Pending => {}
            done => return done,
        }
        if visiting.contains(&id) {
            warn!("recursive type reference; treating instance size as data-dependent");
            return SizeState::Variable;
        }
        visiting.insert(id);

        // Take the definition out so referenced types can be completed
        // through `self` while this one is being filled in.
        let mut ty = mem::take(&mut self.types[id]);
        let mut total: Option<u32> = Some(0);
        for field in &mut ty.fields {
            let object_size = if field.references_object() {
                match field.type_name.as_deref().map(|n| self.by_name.get(n).copied()) {
                    Some(Some(ref_id)) => {
                        field.object_type = Some(ref_id);
                        match self.complete_type(ref_id.0, visiting) {
                            SizeState::Fixed(size) => Some(size),
                            _ => None,
                        }
                    }
                    Some(None) => {
                        warn!(
                            "field {:?} of type {:?} references unknown type {:?}",
                            field.name,
                            ty.name,
                            field.type_name.as_deref().unwrap_or("")
                        );
                        None
                    }
                    // Inline definitions have no resolvable type.
                    None => None,
                }
            } else {
                None
            };
            field.compute_byte_size(object_size);
            total = match (total, field.byte_size) {
                (Some(t), Some(f)) => t.checked_add(f),
                _ => None,
            };
        }
        ty.byte_size = match total {
            Some(size) => SizeState::Fixed(size),
            None => SizeState::Variable,
        };
        let result = ty.byte_size;
        self.types[id] = ty;
        visiting.remove(&id);
        result
    }
}
