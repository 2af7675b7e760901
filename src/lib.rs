//! # hfa-engine
//!
//! A reader/writer engine for HFA containers, the self-describing binary
//! format used by Erdas Imagine raster files (.img and friends).
//!
//! Every container embeds a textual type dictionary describing the layout
//! of its own objects; this crate parses that dictionary and interprets
//! entry bytes through it, so no object layout is hard-coded. It also
//! implements the format's run-length block codec for raster data.
pub mod hfa;

// Re-export the main types for convenience
pub use hfa::{
    EntryId, FieldDescriptor, FieldPath, FieldValue, HfaError, HfaFile, ItemType, Pointer,
    RandomAccess, Result, SampleType, SetSource, TypeDefinition, TypeDictionary,
};
