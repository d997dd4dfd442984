//! Mapping Engine.
//!
//! Turns a source row into a canonical document using a declarative,
//! per-tenant [`MappingDescriptor`]. Mapping is pure: it performs no I/O,
//! and the same row and descriptor always give a byte-identical payload.
//!
//! Every payload carries `resourceType` and an `identifier` built from the
//! source id, so the canonical store can find the resource by natural key.
//! Source nulls never become empty strings or zeros; the target is left
//! absent. References to other resources are recorded as
//! [`ResourceLink`](crate::types::ResourceLink)s for the writer to resolve.
//!
//! The [`DescriptorRegistry`] holds the active descriptor per tenant and
//! resource type and can load a directory of JSON descriptor files.

mod descriptor;
mod engine;
mod registry;
mod transforms;

pub use descriptor::{
    CodeOutput, CodeTarget, FieldRule, MappingDescriptor, TemporalPrecision, Transform,
    UnmappedCode,
};
pub use engine::{map_record, map_row};
pub use registry::DescriptorRegistry;
