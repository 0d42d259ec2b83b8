use super::error::Error;
use super::layer_stack::{LayerStack, LayerStackIdentifier};
use crate::sdf;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct RegistryState {
	by_identifier: HashMap<LayerStackIdentifier, Weak<LayerStack>>,
	/// Layer identifier to the stacks that contain it.
	by_layer: HashMap<String, Vec<Weak<LayerStack>>>,
	/// Muted layer identifier to the stacks that would contain it.
	by_muted_layer: HashMap<String, Vec<Weak<LayerStack>>>,
}

/// Shares layer stacks between the composition caches that use it.
///
/// Stacks are held weakly: a stack lives as long as some prim index,
/// dependency record or cache refers to it.
pub struct LayerStackRegistry {
	id: u64,
	state: RwLock<RegistryState>,
	/// Sorted identifiers of muted layers.
	muted: RwLock<Vec<String>>,
}

impl std::fmt::Debug for LayerStackRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LayerStackRegistry")
			.field("id", &self.id)
			.field("muted", &*self.muted.read())
			.finish_non_exhaustive()
	}
}

impl Default for LayerStackRegistry {
	fn default() -> Self {
		Self {
			id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
			state: RwLock::default(),
			muted: RwLock::default(),
		}
	}
}

impl LayerStackRegistry {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Returns the stack for `identifier`, building it on first use.
	///
	/// Errors are only returned when the stack is built by this call.
	pub fn find_or_create(&self, identifier: &LayerStackIdentifier) -> (Arc<LayerStack>, Vec<Error>) {
		if let Some(layer_stack) = self.find(identifier) {
			return (layer_stack, Vec::new());
		}

		let layer_stack = {
			let is_muted = |id: &str| self.is_layer_muted(id);
			Arc::new(LayerStack::new(identifier.clone(), self.id, &is_muted))
		};

		let mut state = self.state.write();
		// Another thread may have built the same stack in the meantime.
		if let Some(existing) = state.by_identifier.get(identifier).and_then(Weak::upgrade) {
			return (existing, Vec::new());
		}

		state
			.by_identifier
			.insert(identifier.clone(), Arc::downgrade(&layer_stack));
		Self::index_layers(&mut state, &layer_stack);

		tracing::trace!(layer_stack = %identifier, "created layer stack");

		let errors = layer_stack.local_errors();
		(layer_stack, errors)
	}

	pub fn find(&self, identifier: &LayerStackIdentifier) -> Option<Arc<LayerStack>> {
		self.state
			.read()
			.by_identifier
			.get(identifier)
			.and_then(Weak::upgrade)
	}

	/// Returns whether `layer_stack` was created by this registry and is still registered.
	pub fn contains(&self, layer_stack: &Arc<LayerStack>) -> bool {
		layer_stack.registry_id() == self.id
			&& self
				.find(layer_stack.identifier())
				.is_some_and(|found| Arc::ptr_eq(&found, layer_stack))
	}

	pub fn find_all_using_layer(&self, layer: &sdf::Layer) -> Vec<Arc<LayerStack>> {
		Self::upgrade_all(self.state.read().by_layer.get(layer.identifier()))
	}

	pub fn find_all_using_muted_layer(&self, identifier: &str) -> Vec<Arc<LayerStack>> {
		Self::upgrade_all(self.state.read().by_muted_layer.get(identifier))
	}

	pub fn all_layer_stacks(&self) -> Vec<Arc<LayerStack>> {
		self.state
			.read()
			.by_identifier
			.values()
			.filter_map(Weak::upgrade)
			.collect()
	}

	/// Mutes and unmutes layers.
	///
	/// On return the vectors only hold the identifiers whose state changed.
	/// A layer in both lists ends up muted. Stacks are not recomputed here.
	pub fn mute_and_unmute_layers(&self, to_mute: &mut Vec<String>, to_unmute: &mut Vec<String>) {
		let mut muted = self.muted.write();

		to_unmute.retain(|id| !to_mute.contains(id));
		to_unmute.retain(|id| match muted.binary_search(id) {
			Ok(pos) => {
				muted.remove(pos);
				true
			}
			Err(_) => false,
		});

		to_mute.retain(|id| match muted.binary_search(id) {
			Ok(_) => false,
			Err(pos) => {
				muted.insert(pos, id.clone());
				true
			}
		});
	}

	pub fn muted_layers(&self) -> Vec<String> {
		self.muted.read().clone()
	}

	pub fn is_layer_muted(&self, identifier: &str) -> bool {
		self.muted
			.read()
			.binary_search_by(|id| id.as_str().cmp(identifier))
			.is_ok()
	}

	/// Rebuilds `layer_stack` with the current muting state.
	///
	/// Returns the layers that were dropped from the stack.
	pub fn recompute(&self, layer_stack: &Arc<LayerStack>) -> Vec<Arc<sdf::Layer>> {
		let dropped = {
			let is_muted = |id: &str| self.is_layer_muted(id);
			layer_stack.recompute(&is_muted)
		};

		let mut guard = self.state.write();
		let state = &mut *guard;
		let weak = Arc::downgrade(layer_stack);
		for entries in state
			.by_layer
			.values_mut()
			.chain(state.by_muted_layer.values_mut())
		{
			entries.retain(|entry| !entry.ptr_eq(&weak));
		}
		Self::index_layers(state, layer_stack);

		dropped
	}

	fn index_layers(state: &mut RegistryState, layer_stack: &Arc<LayerStack>) {
		let weak = Arc::downgrade(layer_stack);
		for id in layer_stack.layer_ids() {
			state.by_layer.entry(id).or_default().push(weak.clone());
		}
		for id in layer_stack.muted_layers() {
			state.by_muted_layer.entry(id).or_default().push(weak.clone());
		}

		// Drop entries of stacks that have been released.
		state.by_identifier.retain(|_, entry| entry.strong_count() > 0);
		for entries in state
			.by_layer
			.values_mut()
			.chain(state.by_muted_layer.values_mut())
		{
			entries.retain(|entry| entry.strong_count() > 0);
		}
	}

	fn upgrade_all(entries: Option<&Vec<Weak<LayerStack>>>) -> Vec<Arc<LayerStack>> {
		entries
			.map(|entries| entries.iter().filter_map(Weak::upgrade).collect())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ar::{self, Resolver};

	fn setup() -> (Arc<ar::MemoryResolver>, LayerStackIdentifier) {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		resolver.create_layer("sub.usda");
		root.insert_sub_layer_path("sub.usda", sdf::Retiming::IDENTITY);
		let id = LayerStackIdentifier::new(root)
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		(resolver, id)
	}

	#[test]
	fn shares_layer_stacks() {
		let (resolver, id) = setup();
		let registry = LayerStackRegistry::new();

		let (a, errors) = registry.find_or_create(&id);
		assert!(errors.is_empty());
		let (b, _) = registry.find_or_create(&id);
		assert!(Arc::ptr_eq(&a, &b));
		assert!(registry.contains(&a));

		let sub = resolver.open_layer("sub.usda").unwrap();
		assert_eq!(registry.find_all_using_layer(&sub).len(), 1);

		let other = LayerStackRegistry::new();
		assert!(!other.contains(&a));

		drop((a, b));
		assert!(registry.find(&id).is_none());
	}

	#[test]
	fn muting_reports_changed_layers_only() {
		let (resolver, id) = setup();
		let registry = LayerStackRegistry::new();
		let (stack, _) = registry.find_or_create(&id);

		let mut mute = vec!["sub.usda".to_string()];
		let mut unmute = vec!["other.usda".to_string()];
		registry.mute_and_unmute_layers(&mut mute, &mut unmute);
		assert_eq!(mute, vec!["sub.usda".to_string()]);
		assert!(unmute.is_empty());
		assert!(registry.is_layer_muted("sub.usda"));

		registry.recompute(&stack);
		assert_eq!(stack.layers().len(), 1);
		assert_eq!(registry.find_all_using_muted_layer("sub.usda").len(), 1);
		let sub = resolver.open_layer("sub.usda").unwrap();
		assert!(registry.find_all_using_layer(&sub).is_empty());

		let mut mute = Vec::new();
		let mut unmute = vec!["sub.usda".to_string()];
		registry.mute_and_unmute_layers(&mut mute, &mut unmute);
		assert_eq!(unmute, vec!["sub.usda".to_string()]);
		assert!(registry.muted_layers().is_empty());
	}
}
