use super::builder::{IndexBuilder, LayerIndexBuilder};
use super::changes::{CacheChanges, Changes};
use super::config::CacheConfig;
use super::dependencies::{
	CulledDependency, Dependencies, Dependency, DependencyFlags, DynamicFileFormatDependencyData,
	classify_node_dependency,
};
use super::diagnostic::coding_error;
use super::error::{Error, Site};
use super::layer_stack::{LayerStack, LayerStackIdentifier};
use super::lifeboat::Lifeboat;
use super::map_function::MapFunction;
use super::parallel_indexer::{ChildSelection, ParallelIndexer, update_payload_set};
use super::path_table::PathTable;
use super::prim_index::{NodeRef, PayloadSet, PrimIndex, PrimIndexInputs, VariantFallbackMap};
use super::property_index::PropertyIndex;
use super::registry::LayerStackRegistry;
use super::statistics::CacheStatistics;
use super::ArcType;
use crate::{ar, sdf};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Computes and caches the prim and property indices of one layer stack.
///
/// Indices are computed on demand and kept until [`Cache::apply`] is told
/// that something they depend on changed. The cache records, for every
/// index, the sites of scene description it was built from, so that edits
/// to a site can be traced back to the indices they invalidate with
/// [`Cache::find_site_dependencies`].
pub struct Cache {
	identifier: LayerStackIdentifier,
	config: CacheConfig,
	layer_stack: Arc<LayerStack>,
	included_payloads: RwLock<PayloadSet>,
	variant_fallbacks: VariantFallbackMap,
	prim_indexes: RwLock<PathTable<Arc<PrimIndex>>>,
	property_indexes: PathTable<PropertyIndex>,
	builder: Arc<dyn IndexBuilder>,
	dependencies: Dependencies,
	// Released last so that everything above can still reach it.
	registry: Arc<LayerStackRegistry>,
}

impl std::fmt::Debug for Cache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Cache")
			.field("identifier", &self.identifier)
			.field("config", &self.config)
			.field("prim_indexes", &self.prim_indexes.read().len())
			.field("property_indexes", &self.property_indexes.len())
			.finish_non_exhaustive()
	}
}

impl Cache {
	/// Creates a cache with a registry of its own.
	pub fn new(identifier: LayerStackIdentifier, config: CacheConfig) -> Self {
		Self::with_registry(identifier, config, LayerStackRegistry::new())
	}

	/// Creates a cache that shares layer stacks through `registry`.
	pub fn with_registry(
		identifier: LayerStackIdentifier,
		config: CacheConfig,
		registry: Arc<LayerStackRegistry>,
	) -> Self {
		Self::with_builder(identifier, config, registry, Arc::new(LayerIndexBuilder))
	}

	pub fn with_builder(
		identifier: LayerStackIdentifier,
		config: CacheConfig,
		registry: Arc<LayerStackRegistry>,
		builder: Arc<dyn IndexBuilder>,
	) -> Self {
		let (layer_stack, errors) = registry.find_or_create(&identifier);
		tracing::debug!(
			layer_stack = %identifier,
			usd = config.usd,
			errors = errors.len(),
			"created cache"
		);

		Self {
			identifier,
			config,
			layer_stack,
			included_payloads: RwLock::default(),
			variant_fallbacks: VariantFallbackMap::new(),
			prim_indexes: RwLock::default(),
			property_indexes: PathTable::new(),
			builder,
			dependencies: Dependencies::new(),
			registry,
		}
	}

	pub fn layer_stack_identifier(&self) -> &LayerStackIdentifier {
		&self.identifier
	}

	/// The layer stack the cache composes.
	pub fn layer_stack(&self) -> &Arc<LayerStack> {
		&self.layer_stack
	}

	pub fn layer_stack_registry(&self) -> &Arc<LayerStackRegistry> {
		&self.registry
	}

	pub fn has_root_layer_stack(&self, layer_stack: &Arc<LayerStack>) -> bool {
		Arc::ptr_eq(&self.layer_stack, layer_stack)
	}

	pub fn find_layer_stack(&self, identifier: &LayerStackIdentifier) -> Option<Arc<LayerStack>> {
		self.registry.find(identifier)
	}

	/// Returns whether `layer_stack` belongs to the registry of this cache.
	pub fn uses_layer_stack(&self, layer_stack: &Arc<LayerStack>) -> bool {
		self.registry.contains(layer_stack)
	}

	pub fn find_all_layer_stacks_using_layer(&self, layer: &sdf::Layer) -> Vec<Arc<LayerStack>> {
		self.registry.find_all_using_layer(layer)
	}

	/// Returns the layer stack for `identifier`, building it if needed.
	pub fn compute_layer_stack(&self, identifier: &LayerStackIdentifier) -> (Arc<LayerStack>, Vec<Error>) {
		self.registry.find_or_create(identifier)
	}

	pub fn config(&self) -> &CacheConfig {
		&self.config
	}

	pub fn is_usd(&self) -> bool {
		self.config.usd
	}

	pub fn file_format_target(&self) -> &str {
		&self.config.file_format_target
	}

	pub fn variant_fallbacks(&self) -> &VariantFallbackMap {
		&self.variant_fallbacks
	}

	/// Replaces the variant fallbacks. Any change invalidates every index.
	pub fn set_variant_fallbacks(&mut self, fallbacks: VariantFallbackMap, changes: Option<&mut Changes>) {
		if self.variant_fallbacks == fallbacks {
			return;
		}
		self.variant_fallbacks = fallbacks;
		self.record_changes(changes, |_, changes| {
			changes.did_change_significantly(&sdf::Path::absolute_root_path());
		});
	}

	pub fn is_payload_included(&self, path: &sdf::Path) -> bool {
		self.included_payloads.read().contains(path)
	}

	pub fn included_payloads(&self) -> PayloadSet {
		self.included_payloads.read().clone()
	}

	/// Includes and excludes the payloads of the given prims.
	///
	/// A path in both lists is included. Every prim whose inclusion actually
	/// changes is reported as significantly changed.
	pub fn request_payloads(
		&mut self,
		include: &[sdf::Path],
		exclude: &[sdf::Path],
		changes: Option<&mut Changes>,
	) {
		let mut flipped = Vec::new();
		{
			let payloads = self.included_payloads.get_mut();
			for path in include {
				if !path.is_prim_path() {
					coding_error!("path <{}> must be a prim path", path);
					continue;
				}
				if payloads.insert(path.clone()) {
					flipped.push(path.clone());
				}
			}
			for path in exclude {
				if !path.is_prim_path() {
					coding_error!("path <{}> must be a prim path", path);
					continue;
				}
				if !include.contains(path) && payloads.remove(path) {
					flipped.push(path.clone());
				}
			}
		}

		if flipped.is_empty() {
			return;
		}
		self.record_changes(changes, |_, changes| {
			for path in &flipped {
				changes.did_change_significantly(path);
			}
		});
	}

	/// Mutes and unmutes layers by identifier.
	///
	/// Returns the identifiers that were actually muted and unmuted.
	pub fn request_layer_muting(
		&mut self,
		mute: &[String],
		unmute: &[String],
		changes: Option<&mut Changes>,
	) -> (Vec<String>, Vec<String>) {
		let _binder = self.bind_resolver_context();
		let root_layer_id = self.identifier.root_layer.identifier();
		let mut to_mute: Vec<String> = mute
			.iter()
			.filter(|id| !id.is_empty())
			.filter(|id| {
				if id.as_str() == root_layer_id {
					coding_error!("cannot mute the root layer @{}@ of a cache", id);
					return false;
				}
				true
			})
			.cloned()
			.collect();
		let mut to_unmute: Vec<String> = unmute
			.iter()
			.filter(|id| !id.is_empty() && !mute.contains(id))
			.cloned()
			.collect();

		if to_mute.is_empty() && to_unmute.is_empty() {
			return (to_mute, to_unmute);
		}

		self.registry
			.mute_and_unmute_layers(&mut to_mute, &mut to_unmute);
		if to_mute.is_empty() && to_unmute.is_empty() {
			return (to_mute, to_unmute);
		}
		tracing::debug!(muted = ?to_mute, unmuted = ?to_unmute, "changed layer muting");

		// Unmuting the root layer of a referenced stack does not touch any
		// existing layer stack, so look for the arcs that failed on it.
		let mut fixed_assets = Vec::new();
		if !to_unmute.is_empty() {
			for (_, prim_index) in self.prim_indexes.get_mut().iter() {
				for error in prim_index.local_errors() {
					if let Error::MutedAssetPath {
						site,
						source_layer,
						asset_path,
						..
					} = error && to_unmute.contains(asset_path)
					{
						fixed_assets.push((site.clone(), source_layer.clone(), asset_path.clone()));
					}
				}
			}
		}

		self.record_changes(changes, |cache, changes| {
			changes.did_mute_and_unmute_layers(cache, &to_mute, &to_unmute);
			for (site, source_layer, asset_path) in &fixed_assets {
				changes.did_maybe_fix_asset(cache, site, source_layer, asset_path);
			}
		});

		(to_mute, to_unmute)
	}

	pub fn muted_layers(&self) -> Vec<String> {
		self.registry.muted_layers()
	}

	pub fn is_layer_muted(&self, identifier: &str) -> bool {
		self.registry.is_layer_muted(identifier)
	}

	/// Returns the computed index at `path`, if there is one.
	pub fn find_prim_index(&self, path: &sdf::Path) -> Option<Arc<PrimIndex>> {
		self.prim_indexes
			.read()
			.get(path)
			.filter(|prim_index| prim_index.is_valid())
			.cloned()
	}

	/// Returns the index at `path`, computing it if needed.
	///
	/// Composition errors of a new index are appended to `errors`.
	pub fn compute_prim_index(&mut self, path: &sdf::Path, errors: &mut Vec<Error>) -> Arc<PrimIndex> {
		self.compute_prim_index_with_predicate(path, None, errors)
	}

	fn compute_prim_index_with_predicate(
		&mut self,
		path: &sdf::Path,
		include_payload_predicate: Option<&(dyn Fn(&sdf::Path) -> bool + Sync)>,
		errors: &mut Vec<Error>,
	) -> Arc<PrimIndex> {
		if let Some(prim_index) = self.find_prim_index(path) {
			return prim_index;
		}
		if !path.is_absolute_root_or_prim_path() {
			coding_error!("path <{}> must be a prim path", path);
			return Arc::default();
		}

		let inputs = PrimIndexInputs {
			registry: &self.registry,
			parent_index: None,
			variant_fallbacks: &self.variant_fallbacks,
			included_payloads: &self.included_payloads,
			include_payload_predicate,
			cull: self.config.cull,
			usd: self.config.usd,
		};
		let outputs = self
			.builder
			.compute_prim_index(path, &self.layer_stack, &inputs);

		errors.extend(outputs.all_errors);
		update_payload_set(&self.included_payloads, path, outputs.payload_state);

		let prim_index = Arc::new(outputs.prim_index);
		if prim_index.is_valid() {
			self.dependencies.add(
				&prim_index,
				outputs.culled_dependencies,
				outputs.dynamic_file_format_dependency,
			);
		}
		*self.prim_indexes.get_mut().entry_or_default(path.clone()) = prim_index.clone();

		tracing::trace!(path = %path, nodes = prim_index.graph.len(), "computed prim index");
		prim_index
	}

	/// Computes the indices at `roots` and, as `children_predicate` asks, the
	/// indices below them, on the rayon pool.
	///
	/// `payload_predicate` decides whether to include payloads of prims not
	/// in the include set; its decisions are recorded in the include set.
	/// Only supported in USD mode.
	pub fn compute_prim_indexes_in_parallel(
		&mut self,
		roots: &[sdf::Path],
		errors: &mut Vec<Error>,
		children_predicate: impl Fn(&PrimIndex) -> ChildSelection + Sync,
		payload_predicate: impl Fn(&sdf::Path) -> bool + Sync,
	) {
		if !self.config.usd {
			coding_error!("computing prim indexes in parallel is only supported in USD mode");
			return;
		}

		let payload_predicate: &(dyn Fn(&sdf::Path) -> bool + Sync) = &payload_predicate;

		// The parent of every root must be available before the batch starts.
		let mut batch = Vec::with_capacity(roots.len());
		for root in roots {
			if !root.is_absolute_root_or_prim_path() {
				coding_error!("path <{}> must be a prim path", root);
				continue;
			}
			let parent = (!root.is_absolute_root()).then(|| {
				self.compute_prim_index_with_predicate(&root.parent_path(), Some(payload_predicate), errors)
			});
			batch.push((parent, root.clone()));
		}

		let inputs = PrimIndexInputs {
			registry: &self.registry,
			parent_index: None,
			variant_fallbacks: &self.variant_fallbacks,
			included_payloads: &self.included_payloads,
			include_payload_predicate: Some(payload_predicate),
			cull: self.config.cull,
			usd: self.config.usd,
		};
		let indexer = ParallelIndexer::new(
			&self.prim_indexes,
			self.dependencies.concurrent_population(),
			&*self.builder,
			&self.layer_stack,
			inputs,
			&children_predicate,
		);
		errors.extend(indexer.run(batch));
	}

	pub fn find_property_index(&self, path: &sdf::Path) -> Option<&PropertyIndex> {
		self.property_indexes
			.get(path)
			.filter(|property_index| !property_index.is_empty())
	}

	/// Returns the index of the property at `path`, computing it if needed.
	///
	/// Property indices are not cached in USD mode.
	pub fn compute_property_index(&mut self, path: &sdf::Path, errors: &mut Vec<Error>) -> &PropertyIndex {
		if !path.is_property_path() {
			coding_error!("path <{}> must be a property path", path);
			return PropertyIndex::empty();
		}
		if self.config.usd {
			coding_error!("property indexes are not cached in USD mode, path was <{}>", path);
			return PropertyIndex::empty();
		}

		if self.find_property_index(path).is_none() {
			let prim_index = self.compute_prim_index(&path.prim_path(), errors);
			let property_index = self.builder.build_property_index(path, &prim_index);
			errors.extend(property_index.local_errors().iter().cloned());
			*self.property_indexes.entry_or_default(path.clone()) = property_index;
		}

		self.property_indexes
			.get(path)
			.unwrap_or(PropertyIndex::empty())
	}

	/// Returns every layer used by the cache's root layer stack or by some cached index.
	pub fn used_layers(&self) -> BTreeSet<Arc<sdf::Layer>> {
		let mut layers: BTreeSet<Arc<sdf::Layer>> = self.layer_stack.layers().into_iter().collect();
		for layer_stack in self.dependencies.used_layer_stacks() {
			layers.extend(layer_stack.layers());
		}
		layers
	}

	/// Changes whenever the result of [`Self::used_layers`] may have changed.
	pub fn used_layers_revision(&self) -> usize {
		self.dependencies.revision()
	}

	pub fn used_root_layers(&self) -> BTreeSet<Arc<sdf::Layer>> {
		let mut layers = BTreeSet::from([self.layer_stack.root_layer().clone()]);
		for layer_stack in self.dependencies.used_layer_stacks() {
			layers.insert(layer_stack.root_layer().clone());
		}
		layers
	}

	/// Returns the path at which `layer` can hold opinions for the prim at
	/// `site_path`, if any layer stack contributing to the prim contains it.
	pub fn can_have_opinion_for_site(&self, site_path: &sdf::Path, layer: &sdf::Layer) -> Option<sdf::Path> {
		let prim_index = self.find_prim_index(site_path)?;

		let mut visited: Vec<&Arc<LayerStack>> = Vec::new();
		for node in prim_index.nodes().filter(|node| !node.is_inert()) {
			let layer_stack = node.layer_stack();
			if visited.iter().any(|seen| Arc::ptr_eq(seen, layer_stack)) {
				continue;
			}
			visited.push(layer_stack);
			if layer_stack.has_layer(layer) {
				return Some(node.path().clone());
			}
		}
		None
	}

	/// Identifiers of sublayers that failed to load in any layer stack.
	pub fn invalid_sublayer_identifiers(&self) -> Vec<String> {
		let mut identifiers = BTreeSet::new();
		for layer_stack in self.registry.all_layer_stacks() {
			for error in layer_stack.local_errors() {
				if let Error::InvalidSublayerPath { sublayer_path, .. } = error {
					identifiers.insert(sublayer_path);
				}
			}
		}
		identifiers.into_iter().collect()
	}

	pub fn is_invalid_sublayer_identifier(&self, identifier: &str) -> bool {
		self.invalid_sublayer_identifiers()
			.iter()
			.any(|id| id == identifier)
	}

	/// Asset paths that failed to open, by the prim whose index reported them.
	pub fn invalid_asset_paths(&self) -> BTreeMap<sdf::Path, Vec<String>> {
		let mut paths: BTreeMap<sdf::Path, Vec<String>> = BTreeMap::new();
		for (path, prim_index) in self.prim_indexes.read().iter() {
			for error in prim_index.local_errors() {
				if let Error::InvalidAssetPath { asset_path, .. } = error {
					paths.entry(path.clone()).or_default().push(asset_path.clone());
				}
			}
		}
		paths
	}

	pub fn is_invalid_asset_path(&self, asset_path: &str) -> bool {
		self.invalid_asset_paths()
			.values()
			.flatten()
			.any(|path| path == asset_path)
	}

	pub fn has_any_dynamic_file_format_argument_field_dependencies(&self) -> bool {
		self.dependencies
			.has_any_dynamic_file_format_argument_field_dependencies()
	}

	pub fn has_any_dynamic_file_format_argument_attribute_dependencies(&self) -> bool {
		self.dependencies
			.has_any_dynamic_file_format_argument_attribute_dependencies()
	}

	pub fn is_possible_dynamic_file_format_argument_field(&self, field: &str) -> bool {
		self.dependencies
			.is_possible_dynamic_file_format_argument_field(field)
	}

	pub fn is_possible_dynamic_file_format_argument_attribute(&self, attribute: &str) -> bool {
		self.dependencies
			.is_possible_dynamic_file_format_argument_attribute(attribute)
	}

	pub fn dynamic_file_format_argument_dependency_data(&self, prim_index_path: &sdf::Path) -> DynamicFileFormatDependencyData {
		self.dependencies
			.dynamic_file_format_dependency_data(prim_index_path)
			.unwrap_or_default()
	}

	/// Returns the cached indices that depend on `site_path` in `layer_stack`.
	///
	/// `mask` selects the kinds of dependency to report. With
	/// `recurse_on_site`, dependencies on sites below `site_path` are
	/// included. With `recurse_on_index`, every cached index below a
	/// reported index is reported too. With
	/// `filter_for_existing_caches_only`, only paths that have a computed
	/// index in this cache are reported.
	pub fn find_site_dependencies(
		&self,
		layer_stack: &Arc<LayerStack>,
		site_path: &sdf::Path,
		mask: DependencyFlags,
		recurse_on_site: bool,
		recurse_on_index: bool,
		filter_for_existing_caches_only: bool,
	) -> Vec<Dependency> {
		let mut deps = Vec::new();

		if !mask.intersects(DependencyFlags::VIRTUAL | DependencyFlags::NON_VIRTUAL) {
			coding_error!("dependency mask must include VIRTUAL or NON_VIRTUAL");
			return deps;
		}
		if !mask.intersects(DependencyFlags::ROOT | DependencyFlags::DIRECT | DependencyFlags::ANCESTRAL) {
			coding_error!("dependency mask must include ROOT, DIRECT or ANCESTRAL");
			return deps;
		}
		if mask.contains(DependencyFlags::ROOT) && !mask.contains(DependencyFlags::NON_VIRTUAL) {
			coding_error!("a dependency mask with ROOT requires NON_VIRTUAL");
			return deps;
		}
		if !self.registry.contains(layer_stack) {
			coding_error!(
				"layer stack {} does not belong to this cache",
				layer_stack.identifier()
			);
			return deps;
		}

		let passes_filter = |index_path: &sdf::Path| {
			if !filter_for_existing_caches_only {
				true
			} else if index_path.is_absolute_root_or_prim_path() {
				self.find_prim_index(index_path).is_some()
			} else if index_path.is_property_path() {
				self.find_property_index(index_path).is_some()
			} else {
				false
			}
		};

		// Arcs connect prims, so dependencies of anything else are found
		// through the prim that owns it.
		let site_prim_path = if site_path.is_absolute_root() || site_path.is_prim_or_prim_variant_selection_path() {
			site_path.clone()
		} else {
			site_path.prim_or_prim_variant_selection_path()
		};

		if mask.contains(DependencyFlags::ROOT)
			&& self.has_root_layer_stack(layer_stack)
			&& !site_path.contains_prim_variant_selection()
			&& passes_filter(site_path)
		{
			deps.push(Dependency {
				index_path: site_path.clone(),
				site_path: site_path.clone(),
				map_func: MapFunction::identity(),
			});
		}

		let mut visits = Vec::new();
		self.dependencies.for_each_dependency_on_site(
			layer_stack,
			&site_prim_path,
			mask.contains(DependencyFlags::ANCESTRAL),
			recurse_on_site,
			|index_path, dep_site_path| visits.push((index_path.clone(), dep_site_path.clone())),
		);

		for (index_path, dep_site_path) in visits {
			// Siblings of a property share its prim but do not depend on it.
			if dep_site_path != site_prim_path
				&& dep_site_path.has_prefix(&site_prim_path)
				&& !dep_site_path.has_prefix(site_path)
			{
				continue;
			}

			// Direct arcs on an ancestor are ancestral for the site below it.
			let local_mask = if dep_site_path != site_prim_path && site_prim_path.has_prefix(&dep_site_path) {
				mask | DependencyFlags::DIRECT
			} else {
				mask
			};

			let local_site_path = if dep_site_path != site_prim_path && dep_site_path.has_prefix(&site_prim_path) {
				dep_site_path.clone()
			} else {
				site_path.clone()
			};

			let Some(prim_index) = self.find_prim_index(&index_path) else {
				continue;
			};

			for node in prim_index.nodes() {
				if node.is_root()
					|| !Arc::ptr_eq(node.layer_stack(), layer_stack)
					|| *node.path() != dep_site_path
				{
					continue;
				}
				if local_mask != DependencyFlags::ANY_INCLUDING_VIRTUAL {
					let flags = classify_node_dependency(node);
					if !local_mask.contains(flags) {
						continue;
					}
				}
				if let Some(dep) = dependency_through_node(node, &local_site_path)
					&& passes_filter(&dep.index_path)
				{
					deps.push(dep);
				}
			}

			for culled in self.dependencies.culled_dependencies(&index_path) {
				if !Arc::ptr_eq(&culled.layer_stack, layer_stack) || culled.site_path != dep_site_path {
					continue;
				}
				if local_mask != DependencyFlags::ANY_INCLUDING_VIRTUAL && !local_mask.contains(culled.flags) {
					continue;
				}
				if let Some(dep) = dependency_through_culled(&culled, &local_site_path)
					&& passes_filter(&dep.index_path)
				{
					deps.push(dep);
				}
			}
		}

		// A site reached both directly and through an ancestor maps the same way.
		let mut seen = HashSet::new();
		deps.retain(|dep| seen.insert((dep.index_path.clone(), dep.site_path.clone())));

		if recurse_on_index {
			deps = self.expand_to_cached_descendants(deps);
		}
		deps
	}

	/// Adds the cached indices below each dependency's index.
	fn expand_to_cached_descendants(&self, mut deps: Vec<Dependency>) -> Vec<Dependency> {
		deps.sort_by(|a, b| a.index_path.cmp(&b.index_path));

		let prim_indexes = self.prim_indexes.read();
		let mut seen: Vec<sdf::Path> = Vec::new();
		let mut expanded = Vec::with_capacity(deps.len());

		for dep in deps {
			// Already covered by an earlier dependency's subtree.
			if seen.iter().any(|prefix| dep.index_path.has_prefix(prefix)) {
				continue;
			}
			seen.push(dep.index_path.clone());

			let mut below = Vec::new();
			if dep.index_path.is_absolute_root_or_prim_path() {
				for (sub_path, prim_index) in prim_indexes.subtree(&dep.index_path) {
					if *sub_path != dep.index_path && prim_index.is_valid() {
						below.push(sub_path.clone());
					}
				}
			}
			for (sub_path, property_index) in self.property_indexes.subtree(&dep.index_path) {
				if *sub_path != dep.index_path && !property_index.is_empty() {
					below.push(sub_path.clone());
				}
			}

			for sub_path in below {
				expanded.push(Dependency {
					site_path: sub_path.replace_prefix(&dep.index_path, &dep.site_path),
					index_path: sub_path,
					map_func: dep.map_func.clone(),
				});
			}
			expanded.push(dep);
		}

		// Keep each dependency ahead of the ones found below it.
		expanded.sort_by(|a, b| a.index_path.cmp(&b.index_path));
		expanded
	}

	/// Like [`Self::find_site_dependencies`], for every layer stack that
	/// contains `layer`.
	///
	/// The offset of `layer` within each stack is folded into the map
	/// function of the dependencies found through it.
	pub fn find_site_dependencies_for_layer(
		&self,
		layer: &sdf::Layer,
		site_path: &sdf::Path,
		mask: DependencyFlags,
		recurse_on_site: bool,
		recurse_on_index: bool,
		filter_for_existing_caches_only: bool,
	) -> Vec<Dependency> {
		let mut result = Vec::new();
		for layer_stack in self.registry.find_all_using_layer(layer) {
			let deps = self.find_site_dependencies(
				&layer_stack,
				site_path,
				mask,
				recurse_on_site,
				recurse_on_index,
				filter_for_existing_caches_only,
			);
			let offset = layer_stack.layer_offset_for_layer(layer);
			result.extend(deps.into_iter().map(|mut dep| {
				if let Some(offset) = offset {
					dep.map_func = dep.map_func.compose_offset(offset);
				}
				dep
			}));
		}
		result
	}

	/// Invalidates cached state as described by `changes`.
	///
	/// Everything removed from the cache is moved to `lifeboat`.
	pub fn apply(&mut self, changes: &CacheChanges, lifeboat: &mut Lifeboat) {
		let root = sdf::Path::absolute_root_path();

		if changes.did_change_significantly.contains(&root) {
			for (_, prim_index) in self.prim_indexes.get_mut().drain_all() {
				if prim_index.is_valid() {
					lifeboat.retain_prim_index(prim_index);
				}
			}
			for (_, property_index) in self.property_indexes.drain_all() {
				if !property_index.is_empty() {
					lifeboat.retain_property_index(property_index);
				}
			}
			self.dependencies.remove_all(lifeboat);
		} else {
			if changes.did_maybe_change_layers {
				self.dependencies.layer_stacks_changed();
			}

			for path in &changes.did_change_significantly {
				if path.is_prim_path() {
					self.remove_prim_and_property_caches(path, lifeboat);
				} else {
					self.remove_property_caches(path, lifeboat);
				}
			}

			for path in &changes.did_change_prims {
				self.remove_prim_cache(path, lifeboat);
				self.remove_property_caches(path, lifeboat);
			}

			for path in changes
				.did_change_specs
				.iter()
				.chain(&changes.did_change_specs_internal)
			{
				if path.is_absolute_root_or_prim_path() {
					if self.rescan_for_specs(path) == Some(false) {
						self.remove_prim_and_property_caches(path, lifeboat);
					}
				} else if path.is_property_path() {
					self.remove_property_cache(path, lifeboat);
				}
			}

			for path in &changes.did_change_prim_specs_and_children_internal {
				let subtree: Vec<sdf::Path> = self
					.prim_indexes
					.get_mut()
					.subtree(path)
					.into_iter()
					.map(|(sub_path, _)| sub_path.clone())
					.collect();
				for sub_path in subtree {
					self.rescan_for_specs(&sub_path);
				}
			}

			// Clear both ends of every rename: new names first, then old ones.
			for (_, new_path) in &changes.did_change_path {
				if !new_path.is_empty() {
					self.remove_prim_and_property_caches(new_path, lifeboat);
				}
			}
			for (old_path, _) in &changes.did_change_path {
				self.remove_prim_and_property_caches(old_path, lifeboat);
			}
		}

		self.fix_payloads_for_renames(&changes.did_change_path);

		tracing::debug!(
			significant = changes.did_change_significantly.len(),
			prims = changes.did_change_prims.len(),
			specs = changes.did_change_specs.len() + changes.did_change_specs_internal.len(),
			renames = changes.did_change_path.len(),
			"applied cache changes"
		);
	}

	// Renames are applied in authored order so that chains like A -> B,
	// B -> C and swaps like B -> C, A -> B both come out right.
	fn fix_payloads_for_renames(&mut self, renames: &[(sdf::Path, sdf::Path)]) {
		if renames.is_empty() {
			return;
		}

		let payloads = self.included_payloads.get_mut();
		let mut renamed: Vec<sdf::Path> = Vec::new();
		for (old_path, new_path) in renames {
			payloads.retain(|path| {
				if !path.has_prefix(old_path) {
					return true;
				}
				renamed.push(path.replace_prefix(old_path, new_path));
				false
			});
			for path in &mut renamed {
				if path.has_prefix(old_path) {
					*path = path.replace_prefix(old_path, new_path);
				}
			}
			// Removed prims lose their payload requests.
			renamed.retain(|path| !path.is_empty());
		}
		payloads.extend(renamed);
	}

	/// Updates the has-specs flags of the cached index at `path`.
	///
	/// Returns whether any node still has specs, or None if nothing is cached.
	fn rescan_for_specs(&mut self, path: &sdf::Path) -> Option<bool> {
		let entry = self.prim_indexes.get_mut().get_mut(path)?;
		if !entry.is_valid() {
			return None;
		}
		// Outstanding handles keep the index as it was.
		let prim_index = Arc::make_mut(entry);
		prim_index.rescan_for_specs();
		Some(prim_index.nodes().any(|node| node.has_specs()))
	}

	fn remove_prim_cache(&mut self, path: &sdf::Path, lifeboat: &mut Lifeboat) {
		if let Some(entry) = self.prim_indexes.get_mut().get_mut(path)
			&& entry.is_valid()
		{
			let prim_index = std::mem::take(entry);
			self.dependencies.remove(&prim_index, lifeboat);
			lifeboat.retain_prim_index(prim_index);
		}
	}

	fn remove_prim_and_property_caches(&mut self, root: &sdf::Path, lifeboat: &mut Lifeboat) {
		for (_, prim_index) in self.prim_indexes.get_mut().erase_subtree(root) {
			if prim_index.is_valid() {
				self.dependencies.remove(&prim_index, lifeboat);
				lifeboat.retain_prim_index(prim_index);
			}
		}
		self.remove_property_caches(root, lifeboat);
	}

	fn remove_property_cache(&mut self, path: &sdf::Path, lifeboat: &mut Lifeboat) {
		if let Some(entry) = self.property_indexes.get_mut(path)
			&& !entry.is_empty()
		{
			lifeboat.retain_property_index(std::mem::take(entry));
		}
	}

	fn remove_property_caches(&mut self, root: &sdf::Path, lifeboat: &mut Lifeboat) {
		for (_, property_index) in self.property_indexes.erase_subtree(root) {
			if !property_index.is_empty() {
				lifeboat.retain_property_index(property_index);
			}
		}
	}

	/// Reports every failed sublayer and asset as possibly fixed and reloads
	/// every used layer except the session layers.
	pub fn reload(&self, changes: &mut Changes) {
		let _binder = self.bind_resolver_context();

		for layer_stack in self.registry.all_layer_stacks() {
			self.report_invalid_sublayers(&layer_stack, changes);
		}
		for (site, source_layer, asset_path) in self.invalid_assets_under(&sdf::Path::absolute_root_path()) {
			changes.did_maybe_fix_asset(self, &site, &source_layer, &asset_path);
		}

		let session_layers = self.layer_stack.session_layers();
		let layers: Vec<Arc<sdf::Layer>> = self
			.used_layers()
			.into_iter()
			.filter(|layer| !session_layers.contains(layer))
			.collect();
		self.reload_layers(&layers, changes);
	}

	/// Like [`Self::reload`], restricted to the indices at and below
	/// `prim_path` and to layers outside the cache's own layer stack.
	pub fn reload_references(&self, changes: &mut Changes, prim_path: &sdf::Path) {
		let _binder = self.bind_resolver_context();

		for (site, source_layer, asset_path) in self.invalid_assets_under(prim_path) {
			changes.did_maybe_fix_asset(self, &site, &source_layer, &asset_path);
		}

		let mut layer_stacks: Vec<Arc<LayerStack>> = Vec::new();
		for (_, prim_index) in self.prim_indexes.read().subtree(prim_path) {
			for node in prim_index.nodes() {
				if !layer_stacks.iter().any(|seen| Arc::ptr_eq(seen, node.layer_stack())) {
					layer_stacks.push(node.layer_stack().clone());
				}
			}
		}

		for layer_stack in &layer_stacks {
			self.report_invalid_sublayers(layer_stack, changes);
		}

		let mut layers: BTreeSet<Arc<sdf::Layer>> = BTreeSet::new();
		for layer_stack in &layer_stacks {
			for layer in layer_stack.layers() {
				if !self.layer_stack.has_layer(&layer) {
					layers.insert(layer);
				}
			}
		}
		let layers: Vec<Arc<sdf::Layer>> = layers.into_iter().collect();
		self.reload_layers(&layers, changes);
	}

	fn report_invalid_sublayers(&self, layer_stack: &LayerStack, changes: &mut Changes) {
		for error in layer_stack.local_errors() {
			if let Error::InvalidSublayerPath {
				layer,
				sublayer_path,
			} = error
			{
				changes.did_maybe_fix_sublayer(self, &layer, &sublayer_path);
			}
		}
	}

	fn invalid_assets_under(&self, root: &sdf::Path) -> Vec<(Site, String, String)> {
		let mut assets = Vec::new();
		for (_, prim_index) in self.prim_indexes.read().subtree(root) {
			for error in prim_index.local_errors() {
				if let Error::InvalidAssetPath {
					site,
					source_layer,
					asset_path,
					..
				} = error
				{
					assets.push((site.clone(), source_layer.clone(), asset_path.clone()));
				}
			}
		}
		assets
	}

	fn reload_layers(&self, layers: &[Arc<sdf::Layer>], changes: &mut Changes) {
		let reloaded = sdf::Layer::reload_layers(layers);
		tracing::debug!(requested = layers.len(), reloaded = reloaded.len(), "reloaded layers");
		for layer in &reloaded {
			for layer_stack in self.registry.find_all_using_layer(layer) {
				changes.did_change_layer_stack(self, &layer_stack);
			}
		}
	}

	pub fn statistics(&self) -> CacheStatistics {
		CacheStatistics::collect(
			&self.prim_indexes.read(),
			&self.property_indexes,
			&self.dependencies,
			&self.registry,
		)
	}

	pub fn print_statistics(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
		writeln!(writer, "{}", self.statistics())
	}

	fn bind_resolver_context(&self) -> Option<ar::ResolverContextBinder> {
		let context = &self.identifier.resolver_context;
		(!context.is_empty()).then(|| ar::ResolverContextBinder::new(context))
	}

	// Edits made without a change collector are applied right away.
	fn record_changes(&mut self, changes: Option<&mut Changes>, record: impl FnOnce(&Self, &mut Changes)) {
		match changes {
			Some(changes) => record(self, changes),
			None => {
				let mut changes = Changes::new();
				record(self, &mut changes);
				changes.apply(self);
			}
		}
	}
}

/// Translates `site_path`, a path in the namespace of `node`, to the
/// namespace of the index.
fn dependency_through_node(node: NodeRef, site_path: &sdf::Path) -> Option<Dependency> {
	let index_path = if node.arc_type() == ArcType::Relocate {
		// Step out of the relocations to the node they were applied to.
		let mut parent = node.parent()?;
		while parent.arc_type() == ArcType::Relocate {
			parent = parent.parent()?;
		}
		translate_to_root(
			parent.map_to_root(),
			&site_path.replace_prefix(node.path(), parent.path()),
		)?
	} else {
		translate_to_root(node.map_to_root(), site_path)?
	};

	Some(Dependency {
		index_path,
		site_path: site_path.clone(),
		map_func: node.map_to_root().clone(),
	})
}

fn dependency_through_culled(culled: &CulledDependency, site_path: &sdf::Path) -> Option<Dependency> {
	let path = if culled.unrelocated_site_path.is_empty() {
		site_path.clone()
	} else {
		site_path.replace_prefix(&culled.site_path, &culled.unrelocated_site_path)
	};

	Some(Dependency {
		index_path: translate_to_root(&culled.map_to_root, &path)?,
		site_path: site_path.clone(),
		map_func: culled.map_to_root.clone(),
	})
}

fn translate_to_root(map_to_root: &MapFunction, path: &sdf::Path) -> Option<sdf::Path> {
	let mapped = map_to_root
		.map_source_to_target(path)?
		.strip_all_variant_selections();
	(!mapped.is_empty()).then_some(mapped)
}

impl Drop for Cache {
	fn drop(&mut self) {
		tracing::debug!(layer_stack = %self.identifier, "destroying cache");

		let included_payloads = std::mem::take(self.included_payloads.get_mut());
		let variant_fallbacks = std::mem::take(&mut self.variant_fallbacks);
		let prim_indexes = std::mem::take(self.prim_indexes.get_mut());
		let property_indexes = std::mem::take(&mut self.property_indexes);

		// These hold no references to each other.
		rayon::scope(|scope| {
			scope.spawn(move |_| drop(included_payloads));
			scope.spawn(move |_| drop(variant_fallbacks));
			scope.spawn(move |_| prim_indexes.clear_in_parallel());
			scope.spawn(move |_| drop(property_indexes));
		});

		// The dependency records hold the layer stacks, which must outlive
		// the indices. The root layer stack and the registry go after this.
		drop(std::mem::take(&mut self.dependencies));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn setup() -> (Arc<ar::MemoryResolver>, Arc<sdf::Layer>, LayerStackIdentifier) {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		let identifier = LayerStackIdentifier::new(root.clone())
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		(resolver, root, identifier)
	}

	#[test]
	fn computes_once() {
		let (_resolver, root, identifier) = setup();
		root.define_prim(&sdf::Path::from("/A"), sdf::Specifier::Def);
		let mut cache = Cache::new(identifier, CacheConfig::default());

		let mut errors = Vec::new();
		let first = cache.compute_prim_index(&sdf::Path::from("/A"), &mut errors);
		let second = cache.compute_prim_index(&sdf::Path::from("/A"), &mut errors);
		assert!(errors.is_empty());
		assert!(Arc::ptr_eq(&first, &second));
		assert!(first.has_specs());
	}

	#[test]
	fn placeholders_are_not_found() {
		let (_resolver, root, identifier) = setup();
		root.define_prim(&sdf::Path::from("/A/B"), sdf::Specifier::Def);
		let mut cache = Cache::new(identifier, CacheConfig::default());

		cache.compute_prim_index(&sdf::Path::from("/A/B"), &mut Vec::new());
		assert!(cache.find_prim_index(&sdf::Path::from("/A/B")).is_some());
		assert!(cache.find_prim_index(&sdf::Path::from("/A")).is_none());
		assert_eq!(cache.statistics().placeholders, 2);
	}

	#[test]
	fn rejects_wrong_path_kinds() {
		let (_resolver, _root, identifier) = setup();
		let mut cache = Cache::new(identifier, CacheConfig::default());

		let prim_index = cache.compute_prim_index(&sdf::Path::from("/A.size"), &mut Vec::new());
		assert!(!prim_index.is_valid());
		assert!(
			cache
				.compute_property_index(&sdf::Path::from("/A"), &mut Vec::new())
				.is_empty()
		);

		cache.request_payloads(&[sdf::Path::from("/A.size")], &[], None);
		assert!(cache.included_payloads().is_empty());
	}

	#[test]
	fn property_indexes_are_not_cached_in_usd_mode() {
		let (_resolver, root, identifier) = setup();
		root.define_prim(&sdf::Path::from("/A"), sdf::Specifier::Def);
		root.create_property(&sdf::Path::from("/A.size"));

		let mut cache = Cache::new(identifier.clone(), CacheConfig::default());
		let property_index = cache.compute_property_index(&sdf::Path::from("/A.size"), &mut Vec::new());
		assert_eq!(property_index.property_stack().len(), 1);
		assert!(cache.find_property_index(&sdf::Path::from("/A.size")).is_some());

		let mut usd_cache = Cache::new(identifier, CacheConfig::usd());
		assert!(
			usd_cache
				.compute_property_index(&sdf::Path::from("/A.size"), &mut Vec::new())
				.is_empty()
		);
		assert!(usd_cache.find_property_index(&sdf::Path::from("/A.size")).is_none());
	}

	#[test]
	fn payload_renames_follow_chains() {
		let (_resolver, _root, identifier) = setup();
		let mut cache = Cache::new(identifier, CacheConfig::default());
		cache.request_payloads(&[sdf::Path::from("/A/foo"), sdf::Path::from("/X")], &[], None);

		let changes = CacheChanges {
			did_change_path: vec![
				(sdf::Path::from("/A"), sdf::Path::from("/B")),
				(sdf::Path::from("/B"), sdf::Path::from("/C")),
				(sdf::Path::from("/X"), sdf::Path::empty_path()),
			],
			..CacheChanges::default()
		};
		cache.apply(&changes, &mut Lifeboat::new());

		assert_eq!(
			cache.included_payloads(),
			PayloadSet::from([sdf::Path::from("/C/foo")])
		);
	}
}
