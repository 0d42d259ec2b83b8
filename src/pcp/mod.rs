//! Prim Cache Population
//!
//! Composes the opinions of layer stacks into prim indices, caches them,
//! and tracks which sites of scene description each index was built from
//! so that edits invalidate exactly the affected indices.

mod builder;
mod cache;
mod changes;
mod config;
mod dependencies;
pub mod diagnostic;
mod error;
mod graph;
mod layer_stack;
mod lifeboat;
mod map_function;
mod parallel_indexer;
mod path_table;
mod prim_index;
mod property_index;
mod registry;
mod statistics;

pub use builder::{IndexBuilder, LayerIndexBuilder};
pub use cache::Cache;
pub use changes::{CacheChanges, Changes};
pub use config::CacheConfig;
pub use dependencies::{
	CulledDependency, Dependencies, Dependency, DependencyFlags, DynamicFileFormatDependencyData,
	classify_node_dependency,
};
pub use error::{Error, Site};
pub use graph::*;
pub use layer_stack::*;
pub use lifeboat::Lifeboat;
pub use map_function::MapFunction;
pub use parallel_indexer::ChildSelection;
pub use path_table::PathTable;
pub use prim_index::*;
pub use property_index::{PropertyIndex, PropertySite};
pub use registry::LayerStackRegistry;
pub use statistics::CacheStatistics;

/// Describes the type of arc connecting two nodes in the prim index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArcType {
	// The arcs are listed in strength order (LIVERPS).
	// Local is the root node of the prim index and has no parent node.
	Local,
	Inherit,
	Variant,
	Relocate,
	Reference,
	Payload,
	Specialize,
}
