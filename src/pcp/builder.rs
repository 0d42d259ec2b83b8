use super::ArcType;
use super::dependencies::{CulledDependency, DynamicFileFormatDependencyData, classify_node_dependency};
use super::diagnostic::verify;
use super::error::{Error, Site};
use super::graph::{INVALID_NODE_INDEX, Node, PrimIndexGraph};
use super::layer_stack::{LayerStack, LayerStackIdentifier};
use super::map_function::MapFunction;
use super::prim_index::{PayloadState, PrimIndex, PrimIndexInputs, PrimIndexOutputs, site_has_specs};
use super::property_index::PropertyIndex;
use crate::{ar, sdf, tf};
use std::sync::Arc;

/// Separates dynamic file format arguments from a payload asset path.
const FORMAT_ARGS_SEPARATOR: &str = ":SDF_FORMAT_ARGS:";

/// Composes scene description into prim indices.
///
/// The cache never interprets composition arcs itself. It hands the builder
/// the path, the root layer stack and the composition inputs and stores
/// what comes back.
pub trait IndexBuilder: Send + Sync {
	fn compute_prim_index(
		&self,
		path: &sdf::Path,
		layer_stack: &Arc<LayerStack>,
		inputs: &PrimIndexInputs,
	) -> PrimIndexOutputs;

	/// Builds the index of a property from the index of its owning prim.
	///
	/// Never called concurrently.
	fn build_property_index(&self, path: &sdf::Path, prim_index: &PrimIndex) -> PropertyIndex {
		PropertyIndex::build(path, prim_index)
	}
}

/// Builds prim indices by following the arcs authored in layers.
///
/// Arcs are evaluated in LIVERPS strength order. Arcs authored on an
/// ancestor of a node's site apply to the node too and are stronger than
/// arcs of the same kind authored on the site itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayerIndexBuilder;

impl IndexBuilder for LayerIndexBuilder {
	fn compute_prim_index(
		&self,
		path: &sdf::Path,
		layer_stack: &Arc<LayerStack>,
		inputs: &PrimIndexInputs,
	) -> PrimIndexOutputs {
		let context = &layer_stack.identifier().resolver_context;
		let _binder = (!context.is_empty()).then(|| ar::ResolverContextBinder::new(context));

		let mut composer = Composer::new(path, *inputs);
		composer.compose(layer_stack);
		composer.finish()
	}
}

struct NewArc {
	layer_stack: Arc<LayerStack>,
	site_path: sdf::Path,
	arc_type: ArcType,
	map_to_parent: MapFunction,
	is_due_to_ancestor: bool,
}

struct Composer<'a> {
	path: &'a sdf::Path,
	inputs: PrimIndexInputs<'a>,
	graph: PrimIndexGraph,
	local_errors: Vec<Error>,
	layer_stack_errors: Vec<Error>,
	payload_state: PayloadState,
	dynamic: DynamicFileFormatDependencyData,
}

impl<'a> Composer<'a> {
	fn new(path: &'a sdf::Path, inputs: PrimIndexInputs<'a>) -> Self {
		Self {
			path,
			inputs,
			graph: PrimIndexGraph::new(),
			local_errors: Vec::new(),
			layer_stack_errors: Vec::new(),
			payload_state: PayloadState::NoPayload,
			dynamic: DynamicFileFormatDependencyData::default(),
		}
	}

	fn root_layer_stack(&self) -> Arc<LayerStack> {
		self.graph.nodes[0].layer_stack.clone()
	}

	fn compose(&mut self, layer_stack: &Arc<LayerStack>) {
		let relocates = layer_stack.relocates();
		let relocated_target = innermost_relocate(&relocates, self.path, |(_, target)| target);
		let relocated_source = innermost_relocate(&relocates, self.path, |(source, _)| source);

		let mut root = Node::new(
			layer_stack.clone(),
			INVALID_NODE_INDEX,
			INVALID_NODE_INDEX,
			ArcType::Local,
			MapFunction::identity(),
		);
		root.has_specs = site_has_specs(layer_stack, self.path);

		// Opinions at a relocation source are ignored; the prim lives on at the target.
		if relocated_target.is_none() && relocated_source.is_some() {
			root.is_inert = true;
			if root.has_specs {
				self.local_errors.push(Error::OpinionAtRelocationSource {
					site: Site::new(layer_stack.identifier().clone(), self.path.clone()),
				});
			}
			self.graph.add_node(root, self.path.clone());
			return;
		}

		let root_idx = self.graph.add_node(root, self.path.clone());
		self.compose_subtree(root_idx);

		if let Some((source, target)) = relocated_target {
			let source_path = self.path.replace_prefix(&target, &source);
			self.add_arc(
				root_idx,
				root_idx,
				NewArc {
					layer_stack: layer_stack.clone(),
					site_path: source_path,
					arc_type: ArcType::Relocate,
					map_to_parent: MapFunction::new(
						[
							(source, target.clone()),
							(sdf::Path::absolute_root_path(), sdf::Path::absolute_root_path()),
						],
						sdf::Retiming::IDENTITY,
					),
					is_due_to_ancestor: target != *self.path,
				},
			);
		}
	}

	fn compose_subtree(&mut self, node_idx: u16) {
		let layer_stack = self.graph.nodes[node_idx as usize].layer_stack.clone();
		let site_path = self.graph.unshared[node_idx as usize].site_path.clone();

		// Namespace ancestors first: their arcs are stronger.
		let mut ancestors: Vec<sdf::Path> = site_path.ancestors_range().collect();
		ancestors.reverse();

		// A variant node shares its parent's layer stack; arcs the parent saw are not repeated.
		let node = &self.graph.nodes[node_idx as usize];
		if node.arc_type == ArcType::Variant {
			let parent_site = &self.graph.unshared[node.parent_index as usize].site_path;
			ancestors.retain(|check_path| !parent_site.has_prefix(check_path));
		}

		for check_path in &ancestors {
			let specs = prim_specs(&layer_stack, check_path);
			if specs.is_empty() {
				continue;
			}

			let site = CheckSite {
				node_idx,
				layer_stack: &layer_stack,
				check_path,
				site_path: &site_path,
			};
			self.eval_class_arcs(&site, &specs, ArcType::Inherit);
			self.eval_references(&site, &specs);
			self.eval_payloads(&site, &specs);
			self.eval_class_arcs(&site, &specs, ArcType::Specialize);
		}

		self.eval_variants(node_idx, &layer_stack, &site_path, &ancestors);
	}

	fn eval_class_arcs(&mut self, site: &CheckSite, specs: &[(Arc<sdf::Layer>, sdf::PrimSpec)], arc_type: ArcType) {
		let mut class_paths: Vec<sdf::Path> = Vec::new();
		for (_, spec) in specs {
			let authored = match arc_type {
				ArcType::Inherit => &spec.inherits,
				_ => &spec.specializes,
			};
			for class_path in authored {
				if class_path.is_prim_path() && !class_paths.contains(class_path) {
					class_paths.push(class_path.clone());
				}
			}
		}

		let root = sdf::Path::absolute_root_path();
		for class_path in class_paths {
			let target_path = retarget(site.site_path, site.check_path, &class_path);
			let added = self.add_arc(
				site.node_idx,
				site.node_idx,
				NewArc {
					layer_stack: site.layer_stack.clone(),
					site_path: target_path,
					arc_type,
					map_to_parent: MapFunction::new(
						[(class_path.clone(), site.check_path.clone()), (root.clone(), root.clone())],
						sdf::Retiming::IDENTITY,
					),
					is_due_to_ancestor: site.is_due_to_ancestor(),
				},
			);

			// Classes authored across a reference also apply in the root layer stack.
			let root_layer_stack = self.root_layer_stack();
			let Some(origin) = added else { continue };
			if Arc::ptr_eq(site.layer_stack, &root_layer_stack) {
				continue;
			}

			let to_root = self.graph.nodes[site.node_idx as usize].map_to_root.clone();
			let (Some(class_in_root), Some(check_in_root), Some(site_in_root)) = (
				to_root.map_source_to_target(&class_path),
				to_root.map_source_to_target(site.check_path),
				to_root.map_source_to_target(site.site_path),
			) else {
				continue;
			};

			self.add_arc(
				0,
				origin,
				NewArc {
					layer_stack: root_layer_stack,
					site_path: retarget(&site_in_root, &check_in_root, &class_in_root),
					arc_type,
					map_to_parent: MapFunction::new(
						[(class_in_root, check_in_root), (root.clone(), root.clone())],
						sdf::Retiming::IDENTITY,
					),
					is_due_to_ancestor: site.is_due_to_ancestor(),
				},
			);
		}
	}

	fn eval_references(&mut self, site: &CheckSite, specs: &[(Arc<sdf::Layer>, sdf::PrimSpec)]) {
		let mut references: Vec<(&Arc<sdf::Layer>, &sdf::Reference)> = Vec::new();
		for (layer, spec) in specs {
			for reference in &spec.references {
				if !references.iter().any(|(_, r)| {
					r.asset_path == reference.asset_path && r.prim_path == reference.prim_path
				}) {
					references.push((layer, reference));
				}
			}
		}

		for (layer, reference) in references {
			let offset = site
				.layer_stack
				.layer_offset_for_layer(layer)
				.unwrap_or_default()
				* reference.layer_offset;
			self.eval_asset_arc(
				site,
				layer,
				&reference.asset_path,
				&reference.prim_path,
				offset,
				ArcType::Reference,
			);
		}
	}

	fn eval_payloads(&mut self, site: &CheckSite, specs: &[(Arc<sdf::Layer>, sdf::PrimSpec)]) {
		let mut payloads: Vec<(&Arc<sdf::Layer>, &sdf::Payload)> = Vec::new();
		for (layer, spec) in specs {
			for payload in &spec.payloads {
				if !payloads
					.iter()
					.any(|(_, p)| p.asset_path == payload.asset_path && p.prim_path == payload.prim_path)
				{
					payloads.push((layer, payload));
				}
			}
		}
		if payloads.is_empty() {
			return;
		}

		for (_, payload) in &payloads {
			let (_, args) = split_format_args(&payload.asset_path);
			for (key, _) in args {
				self.dynamic.relevant_field_names.insert(tf::Token::new(key));
			}
		}

		if !self.is_payload_included(site) {
			return;
		}

		for (layer, payload) in payloads {
			let (asset_path, _) = split_format_args(&payload.asset_path);
			let offset = site
				.layer_stack
				.layer_offset_for_layer(layer)
				.unwrap_or_default()
				* payload.layer_offset;
			self.eval_asset_arc(
				site,
				layer,
				asset_path,
				&payload.prim_path,
				offset,
				ArcType::Payload,
			);
		}
	}

	fn is_payload_included(&mut self, site: &CheckSite) -> bool {
		if site.is_due_to_ancestor() {
			// The payload belongs to an ancestor prim, which decided already.
			let depth = site.site_path.strip_all_variant_selections().element_count()
				- site.check_path.strip_all_variant_selections().element_count();
			let mut ancestor = self.path.clone();
			for _ in 0..depth {
				ancestor = ancestor.parent_path();
			}
			return self.inputs.included_payloads.read().contains(&ancestor);
		}

		if self.payload_state == PayloadState::NoPayload {
			self.payload_state = if self.inputs.included_payloads.read().contains(self.path) {
				PayloadState::IncludedByIncludeSet
			} else if let Some(predicate) = self.inputs.include_payload_predicate {
				if predicate(self.path) {
					PayloadState::IncludedByPredicate
				} else {
					PayloadState::ExcludedByPredicate
				}
			} else {
				PayloadState::ExcludedByIncludeSet
			};
		}

		matches!(
			self.payload_state,
			PayloadState::IncludedByIncludeSet | PayloadState::IncludedByPredicate
		)
	}

	fn eval_asset_arc(
		&mut self,
		site: &CheckSite,
		source_layer: &sdf::Layer,
		asset_path: &str,
		prim_path: &sdf::Path,
		offset: sdf::Retiming,
		arc_type: ArcType,
	) {
		let error_site = Site::new(site.layer_stack.identifier().clone(), site.site_path.clone());

		let target_layer_stack = if asset_path.is_empty() {
			site.layer_stack.clone()
		} else {
			if self.inputs.registry.is_layer_muted(asset_path) {
				self.local_errors.push(Error::MutedAssetPath {
					site: error_site,
					source_layer: source_layer.identifier().to_string(),
					asset_path: asset_path.to_string(),
					arc_type,
				});
				return;
			}

			let Some(layer) = ar::open_layer(asset_path) else {
				self.local_errors.push(Error::InvalidAssetPath {
					site: error_site,
					source_layer: source_layer.identifier().to_string(),
					asset_path: asset_path.to_string(),
					arc_type,
				});
				return;
			};

			let identifier = LayerStackIdentifier::new(layer)
				.with_resolver_context(site.layer_stack.identifier().resolver_context.clone());
			let (layer_stack, errors) = self.inputs.registry.find_or_create(&identifier);
			self.layer_stack_errors.extend(errors);
			layer_stack
		};

		let target_root = if prim_path.is_empty() {
			target_layer_stack.root_layer().default_prim_as_path()
		} else {
			prim_path.clone()
		};

		let unresolved = target_root.is_empty()
			|| !target_root.is_prim_path()
			|| (!site.is_due_to_ancestor() && !site_has_specs(&target_layer_stack, &target_root));
		if unresolved {
			// Arcs due to an ancestor were reported on the ancestor's index.
			if !site.is_due_to_ancestor() {
				self.local_errors.push(Error::UnresolvedPrimPath {
					site: error_site,
					target_layer: target_layer_stack.root_layer().identifier().to_string(),
					target_path: target_root,
					arc_type,
				});
			}
			return;
		}

		self.add_arc(
			site.node_idx,
			site.node_idx,
			NewArc {
				layer_stack: target_layer_stack,
				site_path: retarget(site.site_path, site.check_path, &target_root),
				arc_type,
				map_to_parent: MapFunction::new([(target_root, site.check_path.clone())], offset),
				is_due_to_ancestor: site.is_due_to_ancestor(),
			},
		);
	}

	fn eval_variants(
		&mut self,
		node_idx: u16,
		layer_stack: &Arc<LayerStack>,
		site_path: &sdf::Path,
		ancestors: &[sdf::Path],
	) {
		for check_path in ancestors {
			let mut variant_sets: Vec<tf::Token> = Vec::new();
			for (_, spec) in prim_specs(layer_stack, check_path) {
				for variant_set in spec.variant_sets {
					if !variant_sets.contains(&variant_set) {
						variant_sets.push(variant_set);
					}
				}
			}

			for variant_set in variant_sets {
				if selects_variant_set(site_path, check_path, &variant_set) {
					continue;
				}

				let Some(variant) = self.variant_selection(node_idx, layer_stack, check_path, &variant_set)
				else {
					continue;
				};

				let variant_root = check_path.append_variant_selection(variant_set.as_str(), &variant);
				self.add_arc(
					node_idx,
					node_idx,
					NewArc {
						layer_stack: layer_stack.clone(),
						site_path: site_path.replace_prefix(check_path, &variant_root),
						arc_type: ArcType::Variant,
						map_to_parent: MapFunction::identity(),
						is_due_to_ancestor: check_path != site_path,
					},
				);
			}
		}
	}

	/// Finds the selection for `variant_set`, strongest node first, falling
	/// back to the first fallback variant that exists.
	fn variant_selection(
		&self,
		node_idx: u16,
		layer_stack: &LayerStack,
		check_path: &sdf::Path,
		variant_set: &tf::Token,
	) -> Option<String> {
		let mut chain = Vec::new();
		let mut current = node_idx;
		while current != INVALID_NODE_INDEX {
			chain.push(current);
			current = self.graph.nodes[current as usize].parent_index;
		}

		for idx in chain.into_iter().rev() {
			let node_layer_stack = &self.graph.nodes[idx as usize].layer_stack;
			let node_path = &self.graph.unshared[idx as usize].site_path;
			for path in node_path.ancestors_range() {
				for (_, spec) in prim_specs(node_layer_stack, &path) {
					if let Some(selection) = spec.variant_selections.get(variant_set) {
						return (!selection.is_empty()).then(|| selection.as_str().to_string());
					}
				}
			}
		}

		let fallbacks = self.inputs.variant_fallbacks.get(variant_set.as_str())?;
		fallbacks
			.iter()
			.find(|variant| {
				let variant_path = check_path.append_variant_selection(variant_set.as_str(), variant);
				site_has_specs(layer_stack, &variant_path)
			})
			.cloned()
	}

	fn add_arc(&mut self, parent_idx: u16, origin_idx: u16, arc: NewArc) -> Option<u16> {
		if arc.site_path.is_empty() {
			return None;
		}

		if !matches!(arc.arc_type, ArcType::Variant | ArcType::Relocate)
			&& self.introduces_cycle(parent_idx, &arc)
		{
			let parent = &self.graph.nodes[parent_idx as usize];
			self.local_errors.push(Error::ArcCycle {
				site: Site::new(
					parent.layer_stack.identifier().clone(),
					self.graph.unshared[parent_idx as usize].site_path.clone(),
				),
				target_path: arc.site_path,
				arc_type: arc.arc_type,
			});
			return None;
		}

		let duplicate = self
			.graph
			.nodes
			.iter()
			.zip(&self.graph.unshared)
			.any(|(node, unshared)| {
				Arc::ptr_eq(&node.layer_stack, &arc.layer_stack) && unshared.site_path == arc.site_path
			});
		if duplicate {
			return None;
		}

		if !verify!(
			self.graph.len() < INVALID_NODE_INDEX as usize - 1,
			"prim index graph for {} is too large",
			self.path
		) {
			return None;
		}

		let mut node = Node::new(
			arc.layer_stack.clone(),
			parent_idx,
			origin_idx,
			arc.arc_type,
			arc.map_to_parent,
		);
		node.is_due_to_ancestor = arc.is_due_to_ancestor;
		node.has_specs = site_has_specs(&arc.layer_stack, &arc.site_path);

		let idx = self.graph.add_child(parent_idx, node, arc.site_path);
		self.compose_subtree(idx);
		Some(idx)
	}

	fn introduces_cycle(&self, parent_idx: u16, arc: &NewArc) -> bool {
		let target = arc.site_path.strip_all_variant_selections();
		let mut current = parent_idx;
		while current != INVALID_NODE_INDEX {
			let node = &self.graph.nodes[current as usize];
			if Arc::ptr_eq(&node.layer_stack, &arc.layer_stack) {
				let path = self.graph.unshared[current as usize]
					.site_path
					.strip_all_variant_selections();
				if path.has_prefix(&target) || target.has_prefix(&path) {
					return true;
				}
			}
			current = node.parent_index;
		}
		false
	}

	fn finish(self) -> PrimIndexOutputs {
		let mut prim_index = PrimIndex::new(self.path.clone(), self.graph, self.local_errors);

		let culled_dependencies = if self.inputs.cull {
			cull(&mut prim_index)
		} else {
			Vec::new()
		};

		let mut all_errors = self.layer_stack_errors;
		all_errors.extend(prim_index.local_errors().iter().cloned());

		tracing::trace!(
			path = %prim_index.path(),
			nodes = prim_index.graph.len(),
			culled = culled_dependencies.len(),
			errors = all_errors.len(),
			"composed prim index"
		);

		PrimIndexOutputs {
			prim_index,
			all_errors,
			payload_state: self.payload_state,
			culled_dependencies,
			dynamic_file_format_dependency: self.dynamic,
		}
	}
}

/// The site an arc is being evaluated at.
struct CheckSite<'s> {
	node_idx: u16,
	layer_stack: &'s Arc<LayerStack>,
	/// The namespace ancestor of `site_path` the arc is authored on.
	check_path: &'s sdf::Path,
	site_path: &'s sdf::Path,
}

impl CheckSite<'_> {
	fn is_due_to_ancestor(&self) -> bool {
		self.check_path != self.site_path
	}
}

/// Removes nodes that contribute nothing and were introduced by an ancestor.
///
/// Returns a dependency for every removed node.
fn cull(prim_index: &mut PrimIndex) -> Vec<CulledDependency> {
	for idx in prim_index.graph.strength_order().into_iter().skip(1) {
		let node = &prim_index.graph.nodes[idx as usize];
		if node.is_culled
			|| !node.is_due_to_ancestor
			|| matches!(node.arc_type, ArcType::Variant | ArcType::Relocate)
		{
			continue;
		}
		if !prim_index.graph.subtree_has_specs(idx) {
			prim_index.graph.mark_subtree_culled(idx);
		}
	}

	let culled: Vec<CulledDependency> = prim_index
		.nodes()
		.filter(|node| node.is_culled())
		.map(|node| {
			let mut unrelocated_site_path = node.path().clone();
			let mut map_node = node;
			while map_node.arc_type() == ArcType::Relocate
				&& let Some(parent) = map_node.parent()
			{
				unrelocated_site_path = unrelocated_site_path.replace_prefix(map_node.path(), parent.path());
				map_node = parent;
			}

			CulledDependency {
				flags: classify_node_dependency(node),
				layer_stack: node.layer_stack().clone(),
				site_path: node.path().clone(),
				unrelocated_site_path,
				map_to_root: map_node.map_to_root().clone(),
			}
		})
		.collect();

	prim_index.graph.remove_culled_nodes();
	culled
}

/// Returns the relocation whose picked side is the longest prefix of `path`.
fn innermost_relocate(
	relocates: &[(sdf::Path, sdf::Path)],
	path: &sdf::Path,
	side: impl Fn(&(sdf::Path, sdf::Path)) -> &sdf::Path,
) -> Option<(sdf::Path, sdf::Path)> {
	relocates
		.iter()
		.filter(|relocate| path.has_prefix(side(relocate)))
		.max_by_key(|relocate| side(relocate).element_count())
		.cloned()
}

fn prim_specs(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<(Arc<sdf::Layer>, sdf::PrimSpec)> {
	layer_stack
		.layers()
		.into_iter()
		.filter_map(|layer| {
			let spec = layer.prim_spec(path)?;
			Some((layer, spec))
		})
		.collect()
}

/// Moves `site_path` from under `check_path` to under `target_root`.
fn retarget(site_path: &sdf::Path, check_path: &sdf::Path, target_root: &sdf::Path) -> sdf::Path {
	site_path
		.strip_all_variant_selections()
		.replace_prefix(&check_path.strip_all_variant_selections(), target_root)
}

/// Returns whether `site_path` already selects a variant of `variant_set` authored on `check_path`.
fn selects_variant_set(site_path: &sdf::Path, check_path: &sdf::Path, variant_set: &tf::Token) -> bool {
	site_path.ancestors_range().any(|path| {
		path.parent_path() == *check_path
			&& path
				.variant_selection()
				.is_some_and(|(set, _)| set == *variant_set)
	})
}

fn split_format_args(asset_path: &str) -> (&str, Vec<(&str, &str)>) {
	match asset_path.split_once(FORMAT_ARGS_SEPARATOR) {
		Some((asset, args)) => (
			asset,
			args.split('&')
				.filter_map(|arg| arg.split_once('='))
				.collect(),
		),
		None => (asset_path, Vec::new()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pcp::registry::LayerStackRegistry;
	use crate::pcp::prim_index::{PayloadSet, VariantFallbackMap};
	use parking_lot::RwLock;

	struct Fixture {
		resolver: Arc<ar::MemoryResolver>,
		registry: Arc<LayerStackRegistry>,
		root: Arc<sdf::Layer>,
		fallbacks: VariantFallbackMap,
		payloads: RwLock<PayloadSet>,
	}

	impl Fixture {
		fn new() -> Self {
			let resolver = ar::MemoryResolver::new();
			let root = resolver.create_layer("root.usda");
			Self {
				resolver,
				registry: LayerStackRegistry::new(),
				root,
				fallbacks: VariantFallbackMap::new(),
				payloads: RwLock::default(),
			}
		}

		fn compute(&self, path: &str, cull: bool) -> PrimIndexOutputs {
			self.compute_with_parent(path, cull, None)
		}

		fn compute_with_parent(&self, path: &str, cull: bool, parent_index: Option<&PrimIndex>) -> PrimIndexOutputs {
			let id = LayerStackIdentifier::new(self.root.clone())
				.with_resolver_context(ar::ResolverContext::new(self.resolver.clone()));
			let (layer_stack, _) = self.registry.find_or_create(&id);
			let inputs = PrimIndexInputs {
				registry: &self.registry,
				parent_index,
				variant_fallbacks: &self.fallbacks,
				included_payloads: &self.payloads,
				include_payload_predicate: None,
				cull,
				usd: true,
			};
			LayerIndexBuilder.compute_prim_index(&sdf::Path::from(path), &layer_stack, &inputs)
		}
	}

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn arcs(outputs: &PrimIndexOutputs) -> Vec<(ArcType, String, String)> {
		outputs
			.prim_index
			.nodes()
			.map(|node| {
				(
					node.arc_type(),
					node.layer_stack().root_layer().identifier().to_string(),
					node.path().to_string(),
				)
			})
			.collect()
	}

	#[test]
	fn composes_external_reference() {
		let f = Fixture::new();
		let model = f.resolver.create_layer("model.usda");
		model.define_prim(&p("/B"), sdf::Specifier::Def);
		model.define_prim(&p("/B/Child"), sdf::Specifier::Def);
		f.root.define_prim(&p("/A"), sdf::Specifier::Def);
		f.root.add_reference(&p("/A"), sdf::Reference::new("model.usda", "/B"));

		let outputs = f.compute("/A", false);
		assert!(outputs.all_errors.is_empty());
		assert_eq!(
			arcs(&outputs),
			vec![
				(ArcType::Local, "root.usda".into(), "/A".into()),
				(ArcType::Reference, "model.usda".into(), "/B".into()),
			]
		);

		let reference = outputs.prim_index.node(1).unwrap();
		assert_eq!(reference.map_to_root().map_source_to_target(&p("/B/Child")), Some(p("/A/Child")));

		let (names, _) = outputs.prim_index.compute_prim_child_names();
		assert_eq!(names, vec![tf::Token::new("Child")]);

		// The child picks up the reference through its parent.
		let child = f.compute("/A/Child", false);
		let node = child.prim_index.node(1).unwrap();
		assert_eq!(node.path(), &p("/B/Child"));
		assert!(node.is_due_to_ancestor());
	}

	#[test]
	fn parent_index_does_not_change_the_result() {
		let f = Fixture::new();
		let model = f.resolver.create_layer("model.usda");
		model.define_prim(&p("/B/Child"), sdf::Specifier::Def);
		f.root.define_prim(&p("/A/Child"), sdf::Specifier::Def);
		f.root.add_reference(&p("/A"), sdf::Reference::new("model.usda", "/B"));

		let parent = f.compute("/A", false);
		let with_parent = f.compute_with_parent("/A/Child", false, Some(&parent.prim_index));
		let without_parent = f.compute("/A/Child", false);
		assert_eq!(arcs(&with_parent), arcs(&without_parent));
		assert_eq!(arcs(&with_parent).len(), 2);
	}

	#[test]
	fn reports_composition_errors() {
		let f = Fixture::new();
		f.root.define_prim(&p("/A"), sdf::Specifier::Def);
		f.root.add_reference(&p("/A"), sdf::Reference::new("missing.usda", "/B"));
		f.root.add_reference(&p("/A"), sdf::Reference::new("", "/Nowhere"));
		f.root.define_prim(&p("/Loop"), sdf::Specifier::Def);
		f.root.add_reference(&p("/Loop"), sdf::Reference::new("", "/Loop/Inner"));
		f.root.define_prim(&p("/Loop/Inner"), sdf::Specifier::Def);

		let outputs = f.compute("/A", false);
		assert_eq!(outputs.prim_index.graph.len(), 1);
		assert!(matches!(outputs.all_errors[0], Error::InvalidAssetPath { .. }));
		assert!(matches!(outputs.all_errors[1], Error::UnresolvedPrimPath { .. }));

		let outputs = f.compute("/Loop", false);
		assert!(matches!(outputs.all_errors[0], Error::ArcCycle { .. }));
	}

	#[test]
	fn selects_variants_and_fallbacks() {
		let mut f = Fixture::new();
		f.root.define_prim(&p("/A"), sdf::Specifier::Def);
		f.root.define_variant(&p("/A"), "shade", "red");
		f.root.define_variant(&p("/A"), "shade", "blue");
		f.root.define_variant(&p("/A"), "lod", "high");
		f.root.set_variant_selection(&p("/A"), "shade", "blue");
		f.fallbacks.insert("lod".into(), vec!["low".into(), "high".into()]);

		let outputs = f.compute("/A", false);
		let paths: Vec<String> = arcs(&outputs).into_iter().map(|(_, _, path)| path).collect();
		assert_eq!(paths, vec!["/A", "/A{shade=blue}", "/A{lod=high}"]);
	}

	#[test]
	fn payloads_follow_the_include_set() {
		let f = Fixture::new();
		let heavy = f.resolver.create_layer("heavy.usda");
		heavy.define_prim(&p("/Heavy"), sdf::Specifier::Def);
		f.root.define_prim(&p("/A"), sdf::Specifier::Def);
		f.root.add_payload(&p("/A"), sdf::Payload::new("heavy.usda:SDF_FORMAT_ARGS:density=4", "/Heavy"));

		let outputs = f.compute("/A", false);
		assert_eq!(outputs.payload_state, PayloadState::ExcludedByIncludeSet);
		assert_eq!(outputs.prim_index.graph.len(), 1);
		assert!(outputs.dynamic_file_format_dependency.relevant_field_names.contains("density"));

		f.payloads.write().insert(p("/A"));
		let outputs = f.compute("/A", false);
		assert_eq!(outputs.payload_state, PayloadState::IncludedByIncludeSet);
		assert_eq!(outputs.prim_index.node(1).unwrap().arc_type(), ArcType::Payload);
	}

	#[test]
	fn culls_ancestral_nodes_without_specs() {
		let f = Fixture::new();
		let model = f.resolver.create_layer("model.usda");
		model.define_prim(&p("/B"), sdf::Specifier::Def);
		f.root.define_prim(&p("/A/C"), sdf::Specifier::Def);
		f.root.add_reference(&p("/A"), sdf::Reference::new("model.usda", "/B"));

		let outputs = f.compute("/A/C", true);
		assert_eq!(outputs.prim_index.graph.len(), 1);
		assert_eq!(outputs.culled_dependencies.len(), 1);
		let culled = &outputs.culled_dependencies[0];
		assert_eq!(culled.site_path, p("/B/C"));
		assert!(culled.flags.contains(crate::pcp::DependencyFlags::ANCESTRAL));

		let outputs = f.compute("/A/C", false);
		assert_eq!(outputs.prim_index.graph.len(), 2);
		assert!(outputs.culled_dependencies.is_empty());
	}

	#[test]
	fn relocations() {
		let f = Fixture::new();
		f.root.define_prim(&p("/Source/Child"), sdf::Specifier::Def);
		f.root.define_prim(&p("/Target"), sdf::Specifier::Def);
		f.root.add_relocate(sdf::Relocate::new("/Source/Child", "/Target/Child"));

		let outputs = f.compute("/Target/Child", false);
		assert_eq!(
			arcs(&outputs)
				.into_iter()
				.map(|(arc, _, path)| (arc, path))
				.collect::<Vec<_>>(),
			vec![
				(ArcType::Local, "/Target/Child".to_string()),
				(ArcType::Relocate, "/Source/Child".to_string()),
			]
		);

		let outputs = f.compute("/Source/Child", false);
		assert!(outputs.prim_index.root_node().unwrap().is_inert());
		assert!(matches!(outputs.all_errors[0], Error::OpinionAtRelocationSource { .. }));
	}
}
