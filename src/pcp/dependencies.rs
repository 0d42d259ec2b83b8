use super::layer_stack::{LayerStack, LayerStackIdentifier};
use super::lifeboat::Lifeboat;
use super::map_function::MapFunction;
use super::path_table::PathTable;
use super::prim_index::{NodeRef, PrimIndex};
use crate::{sdf, tf};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
	/// Classifies how a prim index depends on a site.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct DependencyFlags: u8 {
		/// The root node of the index.
		const ROOT = 1 << 0;
		/// Some arc on the path to the root was authored on the site itself.
		const DIRECT = 1 << 1;
		/// Every arc on the path to the root was introduced by an ancestor.
		const ANCESTRAL = 1 << 2;
		/// The node is inert and contributes no opinions.
		const VIRTUAL = 1 << 3;
		const NON_VIRTUAL = 1 << 4;

		const ANY_NON_VIRTUAL = Self::ROOT.bits() | Self::DIRECT.bits() | Self::ANCESTRAL.bits() | Self::NON_VIRTUAL.bits();
		const ANY_INCLUDING_VIRTUAL = Self::ANY_NON_VIRTUAL.bits() | Self::VIRTUAL.bits();
	}
}

/// Classifies the dependency a node represents.
pub fn classify_node_dependency(node: NodeRef) -> DependencyFlags {
	if node.is_root() {
		return DependencyFlags::ROOT | DependencyFlags::NON_VIRTUAL;
	}

	let mut flags = if node.is_inert() {
		DependencyFlags::VIRTUAL
	} else {
		DependencyFlags::NON_VIRTUAL
	};

	let mut direct = false;
	let mut current = Some(node);
	while let Some(n) = current
		&& !n.is_root()
	{
		if !n.is_due_to_ancestor() {
			direct = true;
			break;
		}
		current = n.parent();
	}

	flags |= if direct {
		DependencyFlags::DIRECT
	} else {
		DependencyFlags::ANCESTRAL
	};
	flags
}

/// A cached prim index that depends on a site.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
	/// The path of the dependent index.
	pub index_path: sdf::Path,
	/// The path of the site in its layer stack.
	pub site_path: sdf::Path,
	/// Maps `site_path` namespace to `index_path` namespace.
	pub map_func: MapFunction,
}

/// A dependency on a node that was culled from the graph of its index.
#[derive(Debug, Clone)]
pub struct CulledDependency {
	pub flags: DependencyFlags,
	pub layer_stack: Arc<LayerStack>,
	pub site_path: sdf::Path,
	/// The site path before stepping out of relocations.
	pub unrelocated_site_path: sdf::Path,
	pub map_to_root: MapFunction,
}

/// Fields and attributes that dynamic file format arguments of an index were computed from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicFileFormatDependencyData {
	pub relevant_field_names: BTreeSet<tf::Token>,
	pub relevant_attribute_names: BTreeSet<tf::Token>,
}

impl DynamicFileFormatDependencyData {
	pub fn is_empty(&self) -> bool {
		self.relevant_field_names.is_empty() && self.relevant_attribute_names.is_empty()
	}
}

const STRIPE_COUNT: usize = 32;

struct SiteDependencies {
	layer_stack: Arc<LayerStack>,
	/// Site path to the index paths that depend on it.
	sites: PathTable<BTreeSet<sdf::Path>>,
	/// Number of prim indices using the layer stack.
	ref_count: usize,
}

#[derive(Default)]
struct IndexDependencies {
	culled: HashMap<sdf::Path, Vec<CulledDependency>>,
	dynamic: HashMap<sdf::Path, DynamicFileFormatDependencyData>,
}

/// The reverse dependency index: which cached prim indices depend on which sites.
///
/// Storage is split into lock-protected stripes so that a parallel batch can
/// add dependencies from many threads.
pub struct Dependencies {
	site_stripes: Vec<Mutex<HashMap<LayerStackIdentifier, SiteDependencies>>>,
	index_stripes: Vec<Mutex<IndexDependencies>>,
	hasher: std::hash::RandomState,
	revision: AtomicUsize,
}

impl Default for Dependencies {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for Dependencies {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dependencies")
			.field("revision", &self.revision())
			.finish_non_exhaustive()
	}
}

impl Dependencies {
	pub fn new() -> Self {
		Self {
			site_stripes: (0..STRIPE_COUNT).map(|_| Mutex::default()).collect(),
			index_stripes: (0..STRIPE_COUNT).map(|_| Mutex::default()).collect(),
			hasher: std::hash::RandomState::new(),
			revision: AtomicUsize::new(0),
		}
	}

	fn stripe_of<T: Hash>(&self, key: &T) -> usize {
		let mut hasher = self.hasher.build_hasher();
		key.hash(&mut hasher);
		hasher.finish() as usize % STRIPE_COUNT
	}

	/// Records the dependencies of a newly computed index.
	pub fn add(
		&mut self,
		prim_index: &PrimIndex,
		culled: Vec<CulledDependency>,
		dynamic: DynamicFileFormatDependencyData,
	) {
		self.add_shared(prim_index, culled, dynamic);
	}

	fn add_shared(
		&self,
		prim_index: &PrimIndex,
		culled: Vec<CulledDependency>,
		dynamic: DynamicFileFormatDependencyData,
	) {
		let index_path = prim_index.path();
		let mut added_stack = false;

		let sites = prim_index
			.nodes()
			.skip(1)
			.map(|node| (node.layer_stack().clone(), node.path().clone()))
			.chain(
				culled
					.iter()
					.map(|dep| (dep.layer_stack.clone(), dep.site_path.clone())),
			);

		for (layer_stack, site_path) in sites {
			let stripe = self.stripe_of(layer_stack.identifier());
			let mut stripe = self.site_stripes[stripe].lock();
			let entry = stripe
				.entry(layer_stack.identifier().clone())
				.or_insert_with(|| SiteDependencies {
					layer_stack: layer_stack.clone(),
					sites: PathTable::new(),
					ref_count: 0,
				});

			entry.sites.entry_or_default(site_path).insert(index_path.clone());
		}

		// Each index counts once per layer stack it uses.
		let mut used: Vec<&Arc<LayerStack>> = Vec::new();
		let nodes: Vec<NodeRef> = prim_index.nodes().skip(1).collect();
		for layer_stack in nodes
			.iter()
			.map(|node| node.layer_stack())
			.chain(culled.iter().map(|dep| &dep.layer_stack))
		{
			if used.iter().any(|l| Arc::ptr_eq(l, layer_stack)) {
				continue;
			}
			used.push(layer_stack);

			let stripe = self.stripe_of(layer_stack.identifier());
			let mut stripe = self.site_stripes[stripe].lock();
			if let Some(entry) = stripe.get_mut(layer_stack.identifier()) {
				entry.ref_count += 1;
				added_stack |= entry.ref_count == 1;
			}
		}

		if !culled.is_empty() || !dynamic.is_empty() {
			let stripe = self.stripe_of(index_path);
			let mut stripe = self.index_stripes[stripe].lock();
			if !culled.is_empty() {
				stripe.culled.insert(index_path.clone(), culled);
			}
			if !dynamic.is_empty() {
				stripe.dynamic.insert(index_path.clone(), dynamic);
			}
		}

		if added_stack {
			self.revision.fetch_add(1, Ordering::AcqRel);
		}
	}

	/// Removes the dependencies recorded for `prim_index`.
	///
	/// Layer stacks no longer used by any index are moved to `lifeboat`.
	pub fn remove(&mut self, prim_index: &PrimIndex, lifeboat: &mut Lifeboat) {
		if !prim_index.is_valid() {
			return;
		}

		let index_path = prim_index.path().clone();
		let (culled, _) = {
			let stripe = self.stripe_of(&index_path);
			let stripe = self.index_stripes[stripe].get_mut();
			(
				stripe.culled.remove(&index_path).unwrap_or_default(),
				stripe.dynamic.remove(&index_path),
			)
		};

		let mut used: Vec<Arc<LayerStack>> = Vec::new();
		let sites: Vec<(Arc<LayerStack>, sdf::Path)> = prim_index
			.nodes()
			.skip(1)
			.map(|node| (node.layer_stack().clone(), node.path().clone()))
			.chain(
				culled
					.into_iter()
					.map(|dep| (dep.layer_stack, dep.site_path)),
			)
			.collect();

		let mut released = false;
		for (layer_stack, site_path) in sites {
			let stripe = self.stripe_of(layer_stack.identifier());
			let stripe = self.site_stripes[stripe].get_mut();
			let Some(entry) = stripe.get_mut(layer_stack.identifier()) else {
				continue;
			};

			if let Some(dependents) = entry.sites.get_mut(&site_path) {
				dependents.remove(&index_path);
				if dependents.is_empty() {
					entry.sites.prune(&site_path, |dependents| dependents.is_empty());
				}
			}

			if used.iter().any(|l| Arc::ptr_eq(l, &layer_stack)) {
				continue;
			}
			used.push(layer_stack.clone());

			entry.ref_count = entry.ref_count.saturating_sub(1);
			if entry.ref_count == 0 {
				if let Some(entry) = stripe.remove(layer_stack.identifier()) {
					lifeboat.retain_layer_stack(entry.layer_stack);
				}
				released = true;
			}
		}

		if released {
			self.revision.fetch_add(1, Ordering::AcqRel);
		}
	}

	/// Removes every dependency, moving the layer stacks to `lifeboat`.
	pub fn remove_all(&mut self, lifeboat: &mut Lifeboat) {
		for stripe in &mut self.site_stripes {
			for (_, entry) in stripe.get_mut().drain() {
				lifeboat.retain_layer_stack(entry.layer_stack);
			}
		}
		for stripe in &mut self.index_stripes {
			*stripe.get_mut() = IndexDependencies::default();
		}
		self.revision.fetch_add(1, Ordering::AcqRel);
	}

	/// Called when the layers of any layer stack may have changed.
	pub fn layer_stacks_changed(&mut self) {
		self.revision.fetch_add(1, Ordering::AcqRel);
	}

	/// Calls `f(index_path, dependency_site_path)` for every index that depends
	/// on `site_path` in `layer_stack`.
	///
	/// With `include_ancestral`, dependencies on ancestors of `site_path` are
	/// visited as well. With `recurse`, dependencies on descendants are.
	pub fn for_each_dependency_on_site(
		&self,
		layer_stack: &LayerStack,
		site_path: &sdf::Path,
		include_ancestral: bool,
		recurse: bool,
		mut f: impl FnMut(&sdf::Path, &sdf::Path),
	) {
		let stripe = self.stripe_of(layer_stack.identifier());
		let stripe = self.site_stripes[stripe].lock();
		let Some(entry) = stripe.get(layer_stack.identifier()) else {
			return;
		};

		if recurse {
			for (dep_site_path, dependents) in entry.sites.subtree(site_path) {
				for index_path in dependents {
					f(index_path, dep_site_path);
				}
			}
		} else if let Some(dependents) = entry.sites.get(site_path) {
			for index_path in dependents {
				f(index_path, site_path);
			}
		}

		if include_ancestral {
			let mut ancestor = site_path.parent_path();
			while !ancestor.is_empty() {
				if let Some(dependents) = entry.sites.get(&ancestor) {
					for index_path in dependents {
						f(index_path, &ancestor);
					}
				}
				ancestor = ancestor.parent_path();
			}
		}
	}

	pub fn culled_dependencies(&self, index_path: &sdf::Path) -> Vec<CulledDependency> {
		let stripe = self.stripe_of(index_path);
		self.index_stripes[stripe]
			.lock()
			.culled
			.get(index_path)
			.cloned()
			.unwrap_or_default()
	}

	pub fn culled_dependency_count(&self) -> usize {
		self.index_stripes
			.iter()
			.map(|stripe| stripe.lock().culled.values().map(Vec::len).sum::<usize>())
			.sum()
	}

	/// Returns every layer stack used by some cached index.
	pub fn used_layer_stacks(&self) -> Vec<Arc<LayerStack>> {
		self.site_stripes
			.iter()
			.flat_map(|stripe| {
				stripe
					.lock()
					.values()
					.map(|entry| entry.layer_stack.clone())
					.collect::<Vec<_>>()
			})
			.collect()
	}

	pub fn uses_layer_stack(&self, layer_stack: &LayerStack) -> bool {
		let stripe = self.stripe_of(layer_stack.identifier());
		self.site_stripes[stripe]
			.lock()
			.contains_key(layer_stack.identifier())
	}

	/// Bumped whenever the set of used layer stacks may have changed.
	pub fn revision(&self) -> usize {
		self.revision.load(Ordering::Acquire)
	}

	pub fn dynamic_file_format_dependency_data(
		&self,
		index_path: &sdf::Path,
	) -> Option<DynamicFileFormatDependencyData> {
		let stripe = self.stripe_of(index_path);
		self.index_stripes[stripe]
			.lock()
			.dynamic
			.get(index_path)
			.cloned()
	}

	pub fn has_any_dynamic_file_format_argument_field_dependencies(&self) -> bool {
		self.index_stripes.iter().any(|stripe| {
			stripe
				.lock()
				.dynamic
				.values()
				.any(|data| !data.relevant_field_names.is_empty())
		})
	}

	pub fn has_any_dynamic_file_format_argument_attribute_dependencies(&self) -> bool {
		self.index_stripes.iter().any(|stripe| {
			stripe
				.lock()
				.dynamic
				.values()
				.any(|data| !data.relevant_attribute_names.is_empty())
		})
	}

	pub fn is_possible_dynamic_file_format_argument_field(&self, field: &str) -> bool {
		self.index_stripes.iter().any(|stripe| {
			stripe
				.lock()
				.dynamic
				.values()
				.any(|data| data.relevant_field_names.contains(field))
		})
	}

	pub fn is_possible_dynamic_file_format_argument_attribute(&self, attribute: &str) -> bool {
		self.index_stripes.iter().any(|stripe| {
			stripe
				.lock()
				.dynamic
				.values()
				.any(|data| data.relevant_attribute_names.contains(attribute))
		})
	}

	/// Enters concurrent population mode for as long as the returned context lives.
	pub fn concurrent_population(&mut self) -> ConcurrentPopulationContext<'_> {
		tracing::trace!("entering concurrent dependency population");
		ConcurrentPopulationContext { dependencies: self }
	}
}

/// Allows dependencies to be added from several threads at once.
pub struct ConcurrentPopulationContext<'a> {
	dependencies: &'a Dependencies,
}

impl ConcurrentPopulationContext<'_> {
	pub fn add(
		&self,
		prim_index: &PrimIndex,
		culled: Vec<CulledDependency>,
		dynamic: DynamicFileFormatDependencyData,
	) {
		self.dependencies.add_shared(prim_index, culled, dynamic);
	}
}

impl Drop for ConcurrentPopulationContext<'_> {
	fn drop(&mut self) {
		tracing::trace!("leaving concurrent dependency population");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ar;
	use crate::pcp::ArcType;
	use crate::pcp::graph::{INVALID_NODE_INDEX, Node, PrimIndexGraph};
	use crate::pcp::registry::LayerStackRegistry;

	fn stack(registry: &LayerStackRegistry, resolver: &Arc<ar::MemoryResolver>, id: &str) -> Arc<LayerStack> {
		let layer = resolver.create_layer(id);
		registry
			.find_or_create(
				&LayerStackIdentifier::new(layer)
					.with_resolver_context(ar::ResolverContext::new(resolver.clone())),
			)
			.0
	}

	fn referencing_index(root: &Arc<LayerStack>, target: &Arc<LayerStack>, path: &str, target_path: &str) -> PrimIndex {
		let mut graph = PrimIndexGraph::new();
		graph.add_node(
			Node::new(
				root.clone(),
				INVALID_NODE_INDEX,
				INVALID_NODE_INDEX,
				ArcType::Local,
				MapFunction::identity(),
			),
			path.into(),
		);
		graph.add_child(
			0,
			Node::new(
				target.clone(),
				0,
				0,
				ArcType::Reference,
				MapFunction::new(
					[(sdf::Path::from(target_path), sdf::Path::from(path))],
					sdf::Retiming::IDENTITY,
				),
			),
			target_path.into(),
		);
		PrimIndex::new(path.into(), graph, Vec::new())
	}

	#[test]
	fn reverse_lookup_finds_dependents() {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let root = stack(&registry, &resolver, "root.usda");
		let model = stack(&registry, &resolver, "model.usda");

		let mut deps = Dependencies::new();
		let index = referencing_index(&root, &model, "/A", "/B");
		let revision = deps.revision();
		deps.add(&index, Vec::new(), DynamicFileFormatDependencyData::default());
		assert!(deps.revision() > revision);
		assert!(deps.uses_layer_stack(&model));

		let mut found = Vec::new();
		deps.for_each_dependency_on_site(&model, &"/B".into(), false, false, |index_path, site| {
			found.push((index_path.clone(), site.clone()));
		});
		assert_eq!(found, vec![(sdf::Path::from("/A"), sdf::Path::from("/B"))]);

		// Ancestral lookups see dependencies on /B from /B/C.
		let mut found = Vec::new();
		deps.for_each_dependency_on_site(&model, &"/B/C".into(), true, false, |index_path, _| {
			found.push(index_path.clone());
		});
		assert_eq!(found, vec![sdf::Path::from("/A")]);

		let mut lifeboat = Lifeboat::default();
		deps.remove(&index, &mut lifeboat);
		assert!(!deps.uses_layer_stack(&model));
		assert_eq!(lifeboat.layer_stacks().len(), 1);
	}

	fn site_entry_count(deps: &Dependencies, layer_stack: &LayerStack) -> usize {
		let stripe = deps.stripe_of(layer_stack.identifier());
		deps.site_stripes[stripe]
			.lock()
			.get(layer_stack.identifier())
			.map_or(0, |entry| entry.sites.len())
	}

	#[test]
	fn removed_indices_leave_no_site_entries_behind() {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let root = stack(&registry, &resolver, "root.usda");
		let model = stack(&registry, &resolver, "model.usda");

		let mut deps = Dependencies::new();
		let kept = referencing_index(&root, &model, "/Kept", "/Kept");
		deps.add(&kept, Vec::new(), DynamicFileFormatDependencyData::default());
		let before = site_entry_count(&deps, &model);
		assert_eq!(before, 2);

		let mut lifeboat = Lifeboat::default();
		for i in 0..100 {
			let index = referencing_index(&root, &model, &format!("/A{i}"), &format!("/B{i}/Deep"));
			deps.add(&index, Vec::new(), DynamicFileFormatDependencyData::default());
			assert_eq!(site_entry_count(&deps, &model), before + 2);
			deps.remove(&index, &mut lifeboat);
			assert_eq!(site_entry_count(&deps, &model), before);
		}
		assert!(deps.uses_layer_stack(&model));

		deps.remove(&kept, &mut lifeboat);
		assert_eq!(site_entry_count(&deps, &model), 0);
	}

	#[test]
	fn shared_sites_track_each_dependent_once() {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let root = stack(&registry, &resolver, "root.usda");
		let model = stack(&registry, &resolver, "model.usda");

		let mut deps = Dependencies::new();
		let indexes: Vec<PrimIndex> = (0..2000)
			.map(|i| referencing_index(&root, &model, &format!("/A{i}"), "/Shared"))
			.collect();
		for index in &indexes {
			deps.add(index, Vec::new(), DynamicFileFormatDependencyData::default());
		}
		// Adding again does not duplicate the dependent.
		deps.add(&indexes[0], Vec::new(), DynamicFileFormatDependencyData::default());

		let mut count = 0;
		deps.for_each_dependency_on_site(&model, &"/Shared".into(), false, false, |_, _| count += 1);
		assert_eq!(count, indexes.len());

		let mut lifeboat = Lifeboat::default();
		for index in indexes.iter().skip(1) {
			deps.remove(index, &mut lifeboat);
		}
		let mut found = Vec::new();
		deps.for_each_dependency_on_site(&model, &"/Shared".into(), false, false, |index_path, _| {
			found.push(index_path.clone());
		});
		assert_eq!(found, vec![sdf::Path::from("/A0")]);
	}

	#[test]
	fn classifies_nodes() {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let root = stack(&registry, &resolver, "root.usda");
		let model = stack(&registry, &resolver, "model.usda");

		let mut index = referencing_index(&root, &model, "/A/C", "/B/C");
		assert_eq!(
			classify_node_dependency(index.root_node().unwrap()),
			DependencyFlags::ROOT | DependencyFlags::NON_VIRTUAL
		);
		assert_eq!(
			classify_node_dependency(index.node(1).unwrap()),
			DependencyFlags::DIRECT | DependencyFlags::NON_VIRTUAL
		);

		index.graph.nodes[1].is_due_to_ancestor = true;
		index.graph.nodes[1].is_inert = true;
		assert_eq!(
			classify_node_dependency(index.node(1).unwrap()),
			DependencyFlags::ANCESTRAL | DependencyFlags::VIRTUAL
		);
	}

	#[test]
	fn culled_dependencies_are_tracked() {
		let registry = LayerStackRegistry::new();
		let resolver = ar::MemoryResolver::new();
		let root = stack(&registry, &resolver, "root.usda");
		let model = stack(&registry, &resolver, "model.usda");

		let mut graph = PrimIndexGraph::new();
		graph.add_node(
			Node::new(
				root.clone(),
				INVALID_NODE_INDEX,
				INVALID_NODE_INDEX,
				ArcType::Local,
				MapFunction::identity(),
			),
			"/A/C".into(),
		);
		let index = PrimIndex::new("/A/C".into(), graph, Vec::new());
		let culled = CulledDependency {
			flags: DependencyFlags::ANCESTRAL | DependencyFlags::NON_VIRTUAL,
			layer_stack: model.clone(),
			site_path: "/B/C".into(),
			unrelocated_site_path: "/B/C".into(),
			map_to_root: MapFunction::new(
				[(sdf::Path::from("/B"), sdf::Path::from("/A"))],
				sdf::Retiming::IDENTITY,
			),
		};

		let mut deps = Dependencies::new();
		deps.add(&index, vec![culled], DynamicFileFormatDependencyData::default());
		assert_eq!(deps.culled_dependencies(&"/A/C".into()).len(), 1);

		let mut found = Vec::new();
		deps.for_each_dependency_on_site(&model, &"/B".into(), false, true, |index_path, _| {
			found.push(index_path.clone());
		});
		assert_eq!(found, vec![sdf::Path::from("/A/C")]);

		let mut lifeboat = Lifeboat::default();
		deps.remove(&index, &mut lifeboat);
		assert!(deps.culled_dependencies(&"/A/C".into()).is_empty());
		assert!(deps.used_layer_stacks().is_empty());
	}
}
