use super::cache::Cache;
use super::dependencies::DependencyFlags;
use super::error::Site;
use super::layer_stack::LayerStack;
use super::lifeboat::Lifeboat;
use crate::{ar, sdf};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The invalidation a single [`Cache::apply`] call performs.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheChanges {
	/// Paths whose indices must be rebuilt from scratch, with everything below them.
	pub did_change_significantly: BTreeSet<sdf::Path>,
	/// Prims whose index changed but whose descendants are unaffected.
	pub did_change_prims: BTreeSet<sdf::Path>,
	/// Paths whose spec stacks changed.
	pub did_change_specs: BTreeSet<sdf::Path>,
	/// Same as `did_change_specs`, for changes discovered while processing other changes.
	pub did_change_specs_internal: BTreeSet<sdf::Path>,
	/// Prims whose spec stacks and descendants' spec stacks changed.
	pub did_change_prim_specs_and_children_internal: BTreeSet<sdf::Path>,
	/// `(old, new)` renames in the order they were made. An empty new path is a removal.
	pub did_change_path: Vec<(sdf::Path, sdf::Path)>,
	/// The layers of some layer stack may have changed.
	pub did_maybe_change_layers: bool,
}

impl CacheChanges {
	pub fn is_empty(&self) -> bool {
		self.did_change_significantly.is_empty()
			&& self.did_change_prims.is_empty()
			&& self.did_change_specs.is_empty()
			&& self.did_change_specs_internal.is_empty()
			&& self.did_change_prim_specs_and_children_internal.is_empty()
			&& self.did_change_path.is_empty()
			&& !self.did_maybe_change_layers
	}
}

/// Collects the effects of edits on a [`Cache`] and applies them.
///
/// Site-level notifications are turned into per-index changes with the
/// cache's reverse dependency lookup. State the cache lets go of is kept in
/// the lifeboat until this is cleared or dropped.
#[derive(Debug, Default)]
pub struct Changes {
	cache_changes: CacheChanges,
	layer_stacks_to_recompute: Vec<Arc<LayerStack>>,
	lifeboat: Lifeboat,
}

impl Changes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cache_changes(&self) -> &CacheChanges {
		&self.cache_changes
	}

	pub fn layer_stacks_to_recompute(&self) -> &[Arc<LayerStack>] {
		&self.layer_stacks_to_recompute
	}

	pub fn lifeboat(&self) -> &Lifeboat {
		&self.lifeboat
	}

	pub fn is_empty(&self) -> bool {
		self.cache_changes.is_empty() && self.layer_stacks_to_recompute.is_empty()
	}

	pub fn did_change_significantly(&mut self, path: &sdf::Path) {
		self.cache_changes
			.did_change_significantly
			.insert(path.clone());
	}

	pub fn did_change_prims(&mut self, path: &sdf::Path) {
		self.cache_changes.did_change_prims.insert(path.clone());
	}

	pub fn did_change_specs(&mut self, path: &sdf::Path) {
		self.cache_changes.did_change_specs.insert(path.clone());
	}

	pub fn did_change_specs_internal(&mut self, path: &sdf::Path) {
		self.cache_changes
			.did_change_specs_internal
			.insert(path.clone());
	}

	pub fn did_change_prim_specs_and_children_internal(&mut self, path: &sdf::Path) {
		self.cache_changes
			.did_change_prim_specs_and_children_internal
			.insert(path.clone());
	}

	/// Records that the prim at `old_path` now lives at `new_path`.
	///
	/// An empty `new_path` records a removal.
	pub fn did_change_paths(&mut self, old_path: &sdf::Path, new_path: &sdf::Path) {
		self.cache_changes
			.did_change_path
			.push((old_path.clone(), new_path.clone()));
	}

	pub fn did_maybe_change_layers(&mut self) {
		self.cache_changes.did_maybe_change_layers = true;
	}

	/// Marks every cached index that depends on `site_path` in `layer`, or
	/// on anything below it, as significantly changed.
	pub fn did_change_significantly_at_site(&mut self, cache: &Cache, layer: &sdf::Layer, site_path: &sdf::Path) {
		let deps = cache.find_site_dependencies_for_layer(
			layer,
			site_path,
			DependencyFlags::ANY_INCLUDING_VIRTUAL,
			true,
			false,
			true,
		);
		for dep in deps {
			self.did_change_significantly(&dep.index_path);
		}
	}

	/// Records that specs were added to or removed from `layer` at
	/// `site_path` without changing any composition arcs.
	pub fn did_change_spec_stack(&mut self, cache: &Cache, layer: &sdf::Layer, site_path: &sdf::Path) {
		let deps = cache.find_site_dependencies_for_layer(
			layer,
			site_path,
			DependencyFlags::ANY_INCLUDING_VIRTUAL,
			false,
			false,
			true,
		);
		for dep in deps {
			if dep.index_path.is_absolute_root_or_prim_path() {
				self.did_change_specs_internal(&dep.index_path);
			} else {
				self.did_change_specs(&dep.index_path);
			}
		}
	}

	/// Queues `layer_stack` for recomputation and invalidates every index using it.
	pub fn did_change_layer_stack(&mut self, cache: &Cache, layer_stack: &Arc<LayerStack>) {
		if !self
			.layer_stacks_to_recompute
			.iter()
			.any(|queued| Arc::ptr_eq(queued, layer_stack))
		{
			self.layer_stacks_to_recompute.push(layer_stack.clone());
		}
		self.did_maybe_change_layers();

		if cache.has_root_layer_stack(layer_stack) {
			self.did_change_significantly(&sdf::Path::absolute_root_path());
			return;
		}

		let deps = cache.find_site_dependencies(
			layer_stack,
			&sdf::Path::absolute_root_path(),
			DependencyFlags::ANY_INCLUDING_VIRTUAL,
			true,
			false,
			true,
		);
		for dep in deps {
			self.did_change_significantly(&dep.index_path);
		}
	}

	/// Called when the sublayer `sublayer_path` of `layer`, which failed to
	/// load, may now be loadable.
	pub fn did_maybe_fix_sublayer(&mut self, cache: &Cache, layer: &str, sublayer_path: &str) {
		tracing::trace!(layer, sublayer_path, "sublayer may have been fixed");
		for layer_stack in cache.layer_stack_registry().all_layer_stacks() {
			if layer_stack.has_layer_id(layer) && layer_stack.references_sublayer(sublayer_path) {
				self.did_change_layer_stack(cache, &layer_stack);
			}
		}
	}

	/// Called when `asset_path`, which failed to open for an arc authored
	/// at `site`, may now be loadable.
	pub fn did_maybe_fix_asset(&mut self, cache: &Cache, site: &Site, source_layer: &str, asset_path: &str) {
		tracing::trace!(%site, source_layer, asset_path, "asset may have been fixed");
		let Some(layer_stack) = cache.find_layer_stack(&site.layer_stack) else {
			return;
		};

		let deps = cache.find_site_dependencies(
			&layer_stack,
			&site.path,
			DependencyFlags::ANY_INCLUDING_VIRTUAL,
			false,
			false,
			true,
		);
		for dep in deps {
			self.did_change_significantly(&dep.index_path);
		}
	}

	/// Invalidates the layer stacks affected by muting and unmuting layers.
	pub fn did_mute_and_unmute_layers(&mut self, cache: &Cache, muted: &[String], unmuted: &[String]) {
		let registry = cache.layer_stack_registry();
		for id in muted {
			for layer_stack in registry.all_layer_stacks() {
				if layer_stack.has_layer_id(id) {
					self.did_change_layer_stack(cache, &layer_stack);
				}
			}
		}
		for id in unmuted {
			for layer_stack in registry.find_all_using_muted_layer(id) {
				self.did_change_layer_stack(cache, &layer_stack);
			}
		}
	}

	/// Recomputes the queued layer stacks and applies the collected changes to `cache`.
	///
	/// Removed state stays alive in this object's lifeboat.
	pub fn apply(&mut self, cache: &mut Cache) {
		let context = &cache.layer_stack_identifier().resolver_context;
		let _binder = (!context.is_empty()).then(|| ar::ResolverContextBinder::new(context));

		for layer_stack in std::mem::take(&mut self.layer_stacks_to_recompute) {
			for layer in cache.layer_stack_registry().recompute(&layer_stack) {
				self.lifeboat.retain_layer(layer);
			}
			self.lifeboat.retain_layer_stack(layer_stack);
		}

		let cache_changes = std::mem::take(&mut self.cache_changes);
		cache.apply(&cache_changes, &mut self.lifeboat);
	}

	/// Forgets pending changes and releases the lifeboat.
	pub fn clear(&mut self) {
		self.cache_changes = CacheChanges::default();
		self.layer_stacks_to_recompute.clear();
		self.lifeboat.clear();
	}
}
