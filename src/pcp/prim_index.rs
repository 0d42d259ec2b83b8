use super::ArcType;
use super::dependencies::{CulledDependency, DynamicFileFormatDependencyData};
use super::error::Error;
use super::graph::{INVALID_NODE_INDEX, Node, PrimIndexGraph};
use super::layer_stack::LayerStack;
use super::map_function::MapFunction;
use super::registry::LayerStackRegistry;
use crate::{sdf, tf};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Paths of prims whose payloads are included.
pub type PayloadSet = HashSet<sdf::Path>;

/// Variant set name to the variants to try, in order, when nothing is selected.
pub type VariantFallbackMap = BTreeMap<String, Vec<String>>;

/// An index of all the sites of scene description that contribute
/// opinions to a specific prim, under composition semantics.
///
/// An index without nodes is invalid. The cache stores invalid indices as
/// placeholders for prims that have been referenced but not computed.
#[derive(Debug, Clone, Default)]
pub struct PrimIndex {
	pub(crate) path: sdf::Path,
	pub graph: PrimIndexGraph,
	pub(crate) local_errors: Vec<Error>,
}

impl PrimIndex {
	pub fn new(path: sdf::Path, graph: PrimIndexGraph, local_errors: Vec<Error>) -> Self {
		Self {
			path,
			graph,
			local_errors,
		}
	}

	pub fn is_valid(&self) -> bool {
		!self.graph.nodes.is_empty()
	}

	/// The namespace path this index was computed for.
	pub fn path(&self) -> &sdf::Path {
		&self.path
	}

	pub fn root_node(&self) -> Option<NodeRef<'_>> {
		self.node(0)
	}

	pub fn node(&self, index: u16) -> Option<NodeRef<'_>> {
		self.graph.get_node(index)?;
		Some(NodeRef { prim_index: self, index })
	}

	/// Nodes from strongest to weakest.
	pub fn nodes(&self) -> impl Iterator<Item = NodeRef<'_>> {
		self.graph
			.strength_order()
			.into_iter()
			.map(move |index| NodeRef { prim_index: self, index })
	}

	pub fn local_errors(&self) -> &[Error] {
		&self.local_errors
	}

	/// Returns whether any node that contributes opinions has specs.
	pub fn has_specs(&self) -> bool {
		self.graph.nodes.iter().any(|node| node.has_specs && !node.is_inert)
	}

	/// Updates the has-specs flag of every node from the layers.
	///
	/// Returns [`Self::has_specs`] afterwards.
	pub fn rescan_for_specs(&mut self) -> bool {
		for (node, unshared) in self.graph.nodes.iter_mut().zip(&self.graph.unshared) {
			node.has_specs = site_has_specs(&node.layer_stack, &unshared.site_path);
		}
		self.has_specs()
	}

	/// Returns the layers and paths with opinions for this prim, strongest first.
	pub fn prim_stack(&self) -> Vec<(Arc<sdf::Layer>, sdf::Path)> {
		let mut stack = Vec::new();
		for node in self.nodes().filter(|node| !node.is_inert()) {
			let path = node.path();
			for layer in node.layer_stack().layers() {
				if layer.has_spec(path) {
					stack.push((layer, path.clone()));
				}
			}
		}
		stack
	}

	/// Computes the names of the namespace children of this prim.
	///
	/// Returns the child names, strongest opinion first, and the names that
	/// are prohibited because they were relocated away.
	pub fn compute_prim_child_names(&self) -> (Vec<tf::Token>, HashSet<tf::Token>) {
		let mut names = Vec::new();
		let mut seen = HashSet::new();
		let mut prohibited = HashSet::new();

		let Some(root) = self.root_node() else {
			return (names, prohibited);
		};

		for node in self.nodes().filter(|node| !node.is_inert()) {
			for layer in node.layer_stack().layers() {
				for name in layer.prim_children(node.path()) {
					if seen.insert(name.clone()) {
						names.push(name);
					}
				}
			}
		}

		for (source, target) in root.layer_stack().relocates() {
			if source.parent_path() == self.path {
				prohibited.insert(source.name_token());
			}
			if target.parent_path() == self.path {
				let name = target.name_token();
				if seen.insert(name.clone()) {
					names.push(name);
				}
			}
		}

		names.retain(|name| !prohibited.contains(name));
		(names, prohibited)
	}
}

/// Returns whether any layer of `layer_stack` has a spec at `path`.
///
/// The pseudo-root always counts as having specs.
pub(crate) fn site_has_specs(layer_stack: &LayerStack, path: &sdf::Path) -> bool {
	path.is_absolute_root() || layer_stack.layers().iter().any(|layer| layer.has_spec(path))
}

/// A read-only view of one node of a [`PrimIndex`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
	prim_index: &'a PrimIndex,
	index: u16,
}

impl<'a> NodeRef<'a> {
	fn data(&self) -> &'a Node {
		&self.prim_index.graph.nodes[self.index as usize]
	}

	pub fn index(&self) -> u16 {
		self.index
	}

	pub fn layer_stack(&self) -> &'a Arc<LayerStack> {
		&self.data().layer_stack
	}

	/// The node's site path within its layer stack.
	pub fn path(&self) -> &'a sdf::Path {
		&self.prim_index.graph.unshared[self.index as usize].site_path
	}

	pub fn arc_type(&self) -> ArcType {
		self.data().arc_type
	}

	pub fn map_to_parent(&self) -> &'a MapFunction {
		&self.data().map_to_parent
	}

	pub fn map_to_root(&self) -> &'a MapFunction {
		&self.data().map_to_root
	}

	pub fn parent(&self) -> Option<NodeRef<'a>> {
		let parent = self.data().parent_index;
		(parent != INVALID_NODE_INDEX).then(|| self.prim_index.node(parent)).flatten()
	}

	pub fn origin(&self) -> Option<NodeRef<'a>> {
		let origin = self.data().origin_index;
		(origin != INVALID_NODE_INDEX).then(|| self.prim_index.node(origin)).flatten()
	}

	pub fn children(&self) -> Vec<NodeRef<'a>> {
		self.prim_index
			.graph
			.children(self.index)
			.into_iter()
			.map(|index| NodeRef {
				prim_index: self.prim_index,
				index,
			})
			.collect()
	}

	pub fn has_specs(&self) -> bool {
		self.data().has_specs
	}

	pub fn is_inert(&self) -> bool {
		self.data().is_inert
	}

	pub fn is_due_to_ancestor(&self) -> bool {
		self.data().is_due_to_ancestor
	}

	pub fn is_culled(&self) -> bool {
		self.data().is_culled
	}

	pub fn is_root(&self) -> bool {
		self.index == 0
	}
}

impl std::fmt::Debug for NodeRef<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{:?} {}<{}>",
			self.arc_type(),
			self.layer_stack().identifier(),
			self.path()
		)
	}
}

/// How the payload of a prim was handled while building its index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
	/// The prim has no payload of its own.
	#[default]
	NoPayload,
	IncludedByIncludeSet,
	ExcludedByIncludeSet,
	IncludedByPredicate,
	ExcludedByPredicate,
}

/// Everything an index builder needs besides the path and layer stack.
#[derive(Clone, Copy)]
pub struct PrimIndexInputs<'a> {
	pub registry: &'a LayerStackRegistry,
	/// The index of the parent prim, when it has been computed.
	///
	/// A hint only: builders may ignore it. `LayerIndexBuilder` recomposes
	/// ancestral arcs from the layer stack either way.
	pub parent_index: Option<&'a PrimIndex>,
	pub variant_fallbacks: &'a VariantFallbackMap,
	pub included_payloads: &'a RwLock<PayloadSet>,
	/// Decides payload inclusion for prims not in `included_payloads`.
	pub include_payload_predicate: Option<&'a (dyn Fn(&sdf::Path) -> bool + Sync)>,
	pub cull: bool,
	pub usd: bool,
}

/// The result of building one prim index.
#[derive(Debug, Default)]
pub struct PrimIndexOutputs {
	pub prim_index: PrimIndex,
	/// Errors of the index and of every layer stack created while building it.
	pub all_errors: Vec<Error>,
	pub payload_state: PayloadState,
	pub culled_dependencies: Vec<CulledDependency>,
	pub dynamic_file_format_dependency: DynamicFileFormatDependencyData,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ar;
	use crate::pcp::layer_stack::LayerStackIdentifier;

	fn single_node_index(path: &str) -> (Arc<sdf::Layer>, Arc<LayerStack>, PrimIndex) {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let layer = resolver.create_layer("root.usda");
		layer.define_prim(&sdf::Path::from(path), sdf::Specifier::Def);
		let (layer_stack, _) = registry.find_or_create(
			&LayerStackIdentifier::new(layer.clone())
				.with_resolver_context(ar::ResolverContext::new(resolver)),
		);

		let mut graph = PrimIndexGraph::new();
		let mut node = Node::new(
			layer_stack.clone(),
			INVALID_NODE_INDEX,
			INVALID_NODE_INDEX,
			ArcType::Local,
			MapFunction::identity(),
		);
		node.has_specs = true;
		graph.add_node(node, sdf::Path::from(path));
		(layer, layer_stack, PrimIndex::new(path.into(), graph, Vec::new()))
	}

	#[test]
	fn rescan_tracks_spec_removal() {
		let (layer, _stack, mut index) = single_node_index("/A");
		assert!(index.is_valid());
		assert!(index.has_specs());
		assert!(index.rescan_for_specs());

		layer.remove_spec(&sdf::Path::from("/A"));
		assert!(!index.rescan_for_specs());
		assert!(index.prim_stack().is_empty());
	}

	#[test]
	fn child_names_honor_relocations() {
		let (layer, _stack, index) = single_node_index("/A");
		layer.define_prim(&sdf::Path::from("/A/B"), sdf::Specifier::Def);
		layer.define_prim(&sdf::Path::from("/A/C"), sdf::Specifier::Def);
		layer.add_relocate(sdf::Relocate::new("/A/C", "/A/D"));
		let stack = index.root_node().unwrap().layer_stack().clone();
		stack.recompute(&|_: &str| false);

		let (names, prohibited) = index.compute_prim_child_names();
		assert_eq!(names, vec![tf::Token::new("B"), tf::Token::new("D")]);
		assert!(prohibited.contains("C"));
	}

	#[test]
	fn default_index_is_invalid() {
		let index = PrimIndex::default();
		assert!(!index.is_valid());
		assert!(index.root_node().is_none());
		assert_eq!(index.nodes().count(), 0);
	}
}
