//! Asset Resolution
//!
//! Maps layer identifiers to layers. Composition opens every external layer
//! through the context bound on the current thread by a [`ResolverContextBinder`].

use crate::sdf;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Finds layers by identifier.
pub trait Resolver: Send + Sync {
	fn open_layer(&self, identifier: &str) -> Option<Arc<sdf::Layer>>;
}

/// A resolver over layers registered in memory.
#[derive(Default)]
pub struct MemoryResolver {
	layers: RwLock<HashMap<String, Arc<sdf::Layer>>>,
}

impl MemoryResolver {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Registers `layer` under its identifier, replacing any previous layer.
	pub fn insert(&self, layer: Arc<sdf::Layer>) {
		self.layers
			.write()
			.insert(layer.identifier().to_string(), layer);
	}

	/// Creates, registers and returns an empty layer.
	pub fn create_layer(&self, identifier: &str) -> Arc<sdf::Layer> {
		let layer = sdf::Layer::new(identifier);
		self.insert(layer.clone());
		layer
	}

	pub fn remove(&self, identifier: &str) -> Option<Arc<sdf::Layer>> {
		self.layers.write().remove(identifier)
	}
}

impl Resolver for MemoryResolver {
	fn open_layer(&self, identifier: &str) -> Option<Arc<sdf::Layer>> {
		self.layers.read().get(identifier).cloned()
	}
}

/// A resolver handle compared by identity.
#[derive(Clone, Default)]
pub struct ResolverContext {
	resolver: Option<Arc<dyn Resolver>>,
}

impl ResolverContext {
	pub fn new(resolver: Arc<dyn Resolver>) -> Self {
		Self {
			resolver: Some(resolver),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.resolver.is_none()
	}

	fn address(&self) -> usize {
		self.resolver
			.as_ref()
			.map_or(0, |r| Arc::as_ptr(r) as *const () as usize)
	}

	pub fn open_layer(&self, identifier: &str) -> Option<Arc<sdf::Layer>> {
		self.resolver.as_ref()?.open_layer(identifier)
	}
}

impl std::fmt::Debug for ResolverContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.is_empty() {
			f.write_str("ResolverContext(<empty>)")
		} else {
			write!(f, "ResolverContext({:#x})", self.address())
		}
	}
}

impl PartialEq for ResolverContext {
	fn eq(&self, other: &Self) -> bool {
		self.address() == other.address()
	}
}

impl Eq for ResolverContext {}

impl std::hash::Hash for ResolverContext {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.address().hash(state);
	}
}

thread_local! {
	static BOUND_CONTEXTS: RefCell<Vec<ResolverContext>> = const { RefCell::new(Vec::new()) };
}

/// Binds a resolver context to the current thread for as long as it lives.
///
/// Binders nest; dropping one restores the previously bound context, also
/// during unwinding.
#[must_use = "the context is unbound as soon as the binder is dropped"]
pub struct ResolverContextBinder {
	// Thread-local state makes the binder thread-bound.
	_not_send: std::marker::PhantomData<*const ()>,
}

impl ResolverContextBinder {
	pub fn new(context: &ResolverContext) -> Self {
		BOUND_CONTEXTS.with(|stack| stack.borrow_mut().push(context.clone()));
		Self {
			_not_send: std::marker::PhantomData,
		}
	}
}

impl Drop for ResolverContextBinder {
	fn drop(&mut self) {
		BOUND_CONTEXTS.with(|stack| {
			stack.borrow_mut().pop();
		});
	}
}

/// Returns the innermost context bound on this thread, if any.
pub fn current_context() -> Option<ResolverContext> {
	BOUND_CONTEXTS.with(|stack| stack.borrow().last().cloned())
}

/// Opens `identifier` through the context bound on this thread.
pub fn open_layer(identifier: &str) -> Option<Arc<sdf::Layer>> {
	current_context()?.open_layer(identifier)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn binder_scopes_resolution() {
		let resolver = MemoryResolver::new();
		resolver.create_layer("a.usda");
		let context = ResolverContext::new(resolver.clone());

		assert!(open_layer("a.usda").is_none());
		{
			let _binder = ResolverContextBinder::new(&context);
			assert!(open_layer("a.usda").is_some());
			assert!(open_layer("b.usda").is_none());
			{
				let _inner = ResolverContextBinder::new(&ResolverContext::default());
				assert!(open_layer("a.usda").is_none());
			}
			assert!(open_layer("a.usda").is_some());
		}
		assert!(open_layer("a.usda").is_none());
	}

	#[test]
	fn contexts_compare_by_identity() {
		let resolver = MemoryResolver::new();
		let a = ResolverContext::new(resolver.clone());
		let b = ResolverContext::new(resolver);
		let c = ResolverContext::new(MemoryResolver::new());
		assert_eq!(a, b);
		assert_ne!(a, c);
		assert_eq!(ResolverContext::default(), ResolverContext::default());
	}
}
