use super::ArcType;
use super::dependencies::Dependencies;
use super::path_table::PathTable;
use super::prim_index::PrimIndex;
use super::property_index::PropertyIndex;
use super::registry::LayerStackRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts describing the contents of a [`super::Cache`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStatistics {
	pub prim_indexes: usize,
	/// Entries that were referenced but never computed, or were invalidated.
	pub placeholders: usize,
	pub nodes: usize,
	pub nodes_with_specs: usize,
	pub inert_nodes: usize,
	pub culled_dependencies: usize,
	/// Number of nodes introduced by each kind of arc.
	pub arcs: BTreeMap<ArcType, usize>,
	pub property_indexes: usize,
	pub property_specs: usize,
	pub layer_stacks: usize,
	pub used_layer_stacks: usize,
	pub used_layers_revision: usize,
}

impl CacheStatistics {
	pub(crate) fn collect(
		prim_indexes: &PathTable<Arc<PrimIndex>>,
		property_indexes: &PathTable<PropertyIndex>,
		dependencies: &Dependencies,
		registry: &LayerStackRegistry,
	) -> Self {
		let mut stats = Self::default();

		for (_, prim_index) in prim_indexes.iter() {
			if !prim_index.is_valid() {
				stats.placeholders += 1;
				continue;
			}
			stats.prim_indexes += 1;
			for node in prim_index.nodes() {
				stats.nodes += 1;
				if node.has_specs() {
					stats.nodes_with_specs += 1;
				}
				if node.is_inert() {
					stats.inert_nodes += 1;
				}
				if !node.is_root() {
					*stats.arcs.entry(node.arc_type()).or_default() += 1;
				}
			}
		}

		for (_, property_index) in property_indexes.iter() {
			if !property_index.is_empty() {
				stats.property_indexes += 1;
				stats.property_specs += property_index.property_stack().len();
			}
		}

		stats.culled_dependencies = dependencies.culled_dependency_count();
		stats.layer_stacks = registry.all_layer_stacks().len();
		stats.used_layer_stacks = dependencies.used_layer_stacks().len();
		stats.used_layers_revision = dependencies.revision();
		stats
	}
}

impl std::fmt::Display for CacheStatistics {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		writeln!(f, "PcpCache statistics")?;
		writeln!(f, "  prim indexes:          {}", self.prim_indexes)?;
		writeln!(f, "  placeholders:          {}", self.placeholders)?;
		writeln!(f, "  nodes:                 {}", self.nodes)?;
		writeln!(f, "    with specs:          {}", self.nodes_with_specs)?;
		writeln!(f, "    inert:               {}", self.inert_nodes)?;
		writeln!(f, "  culled dependencies:   {}", self.culled_dependencies)?;
		writeln!(f, "  arcs:")?;
		for (arc_type, count) in &self.arcs {
			writeln!(f, "    {:<20} {}", format!("{arc_type:?}:"), count)?;
		}
		writeln!(f, "  property indexes:      {}", self.property_indexes)?;
		writeln!(f, "    property specs:      {}", self.property_specs)?;
		writeln!(f, "  layer stacks:          {}", self.layer_stacks)?;
		writeln!(f, "    used:                {}", self.used_layer_stacks)?;
		write!(f, "  used layers revision:  {}", self.used_layers_revision)
	}
}
