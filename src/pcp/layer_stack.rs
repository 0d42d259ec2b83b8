use super::error::Error;
use crate::{ar, sdf};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Arguments used to identify a layer stack.
///
/// Two identifiers are equal when they name the same root and session layers
/// and the same resolver context.
#[derive(Debug, Clone)]
pub struct LayerStackIdentifier {
	pub root_layer: Arc<sdf::Layer>,
	pub session_layer: Option<Arc<sdf::Layer>>,
	pub resolver_context: ar::ResolverContext,
}

impl LayerStackIdentifier {
	pub fn new(root_layer: Arc<sdf::Layer>) -> Self {
		Self {
			root_layer,
			session_layer: None,
			resolver_context: ar::ResolverContext::default(),
		}
	}

	pub fn with_session_layer(mut self, session_layer: Arc<sdf::Layer>) -> Self {
		self.session_layer = Some(session_layer);
		self
	}

	pub fn with_resolver_context(mut self, resolver_context: ar::ResolverContext) -> Self {
		self.resolver_context = resolver_context;
		self
	}
}

impl PartialEq for LayerStackIdentifier {
	fn eq(&self, other: &Self) -> bool {
		self.root_layer.identifier() == other.root_layer.identifier()
			&& self.session_layer.as_ref().map(|l| l.identifier())
				== other.session_layer.as_ref().map(|l| l.identifier())
			&& self.resolver_context == other.resolver_context
	}
}

impl Eq for LayerStackIdentifier {}

impl std::hash::Hash for LayerStackIdentifier {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.root_layer.identifier().hash(state);
		self.session_layer.as_ref().map(|l| l.identifier()).hash(state);
		self.resolver_context.hash(state);
	}
}

impl std::fmt::Display for LayerStackIdentifier {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "@{}@", self.root_layer.identifier())?;
		if let Some(session_layer) = &self.session_layer {
			write!(f, " (session @{}@)", session_layer.identifier())?;
		}
		Ok(())
	}
}

#[derive(Debug, Default)]
struct LayerStackData {
	/// Layers in the stack, ordered from strongest (index 0) to weakest (last index).
	layers: Vec<Arc<sdf::Layer>>,
	layer_offsets: Vec<sdf::Retiming>,
	session_layer_count: usize,
	/// Composed `(source, target)` relocations, strongest opinion per source.
	relocates: Vec<(sdf::Path, sdf::Path)>,
	local_errors: Vec<Error>,
	/// Every sublayer identifier named while building, whether loaded, muted or missing.
	sublayer_ids: BTreeSet<String>,
	muted_layer_ids: BTreeSet<String>,
}

/// Represents a stack of layers that contribute opinions to composition.
///
/// Layer stacks are shared through the registry that created them and are
/// recomputed in place when the layers they are made of may have changed.
#[derive(Debug)]
pub struct LayerStack {
	identifier: LayerStackIdentifier,
	registry_id: u64,
	data: RwLock<LayerStackData>,
}

impl LayerStack {
	pub(crate) fn new(
		identifier: LayerStackIdentifier,
		registry_id: u64,
		is_muted: &dyn Fn(&str) -> bool,
	) -> Self {
		Self {
			data: RwLock::new(LayerStackData::compute(&identifier, is_muted)),
			identifier,
			registry_id,
		}
	}

	/// Rebuilds the stack. Returns the layers that were dropped from it.
	pub(crate) fn recompute(&self, is_muted: &dyn Fn(&str) -> bool) -> Vec<Arc<sdf::Layer>> {
		let data = LayerStackData::compute(&self.identifier, is_muted);
		let old = std::mem::replace(&mut *self.data.write(), data);

		let current = self.data.read();
		old.layers
			.into_iter()
			.filter(|layer| !current.layers.iter().any(|l| Arc::ptr_eq(l, layer)))
			.collect()
	}

	pub fn identifier(&self) -> &LayerStackIdentifier {
		&self.identifier
	}

	pub(crate) fn registry_id(&self) -> u64 {
		self.registry_id
	}

	pub fn root_layer(&self) -> &Arc<sdf::Layer> {
		&self.identifier.root_layer
	}

	pub fn layers(&self) -> Vec<Arc<sdf::Layer>> {
		self.data.read().layers.clone()
	}

	pub fn layer_offsets(&self) -> Vec<sdf::Retiming> {
		self.data.read().layer_offsets.clone()
	}

	/// The session layer and its sublayers.
	pub fn session_layers(&self) -> Vec<Arc<sdf::Layer>> {
		let data = self.data.read();
		data.layers[..data.session_layer_count].to_vec()
	}

	pub fn has_layer(&self, layer: &sdf::Layer) -> bool {
		self.data.read().layers.iter().any(|l| **l == *layer)
	}

	pub fn has_layer_id(&self, identifier: &str) -> bool {
		self.data
			.read()
			.layers
			.iter()
			.any(|l| l.identifier() == identifier)
	}

	/// Returns the cumulative offset of `layer`, or None if it is not in the stack.
	pub fn layer_offset_for_layer(&self, layer: &sdf::Layer) -> Option<sdf::Retiming> {
		let data = self.data.read();
		let index = data.layers.iter().position(|l| **l == *layer)?;
		data.layer_offsets.get(index).copied()
	}

	pub fn relocates(&self) -> Vec<(sdf::Path, sdf::Path)> {
		self.data.read().relocates.clone()
	}

	pub fn has_relocates(&self) -> bool {
		!self.data.read().relocates.is_empty()
	}

	pub fn local_errors(&self) -> Vec<Error> {
		self.data.read().local_errors.clone()
	}

	/// Returns whether building this stack named `identifier` as a sublayer.
	pub fn references_sublayer(&self, identifier: &str) -> bool {
		self.data.read().sublayer_ids.contains(identifier)
	}

	pub fn muted_layers(&self) -> Vec<String> {
		self.data.read().muted_layer_ids.iter().cloned().collect()
	}

	pub(crate) fn layer_ids(&self) -> Vec<String> {
		self.data
			.read()
			.layers
			.iter()
			.map(|l| l.identifier().to_string())
			.collect()
	}
}

impl LayerStackData {
	fn compute(identifier: &LayerStackIdentifier, is_muted: &dyn Fn(&str) -> bool) -> Self {
		let _binder = (!identifier.resolver_context.is_empty())
			.then(|| ar::ResolverContextBinder::new(&identifier.resolver_context));

		let mut data = Self::default();

		if let Some(session_layer) = &identifier.session_layer {
			if is_muted(session_layer.identifier()) {
				data.muted_layer_ids
					.insert(session_layer.identifier().to_string());
			} else {
				data.build(session_layer.clone(), sdf::Retiming::IDENTITY, &mut Vec::new(), is_muted);
			}
		}
		data.session_layer_count = data.layers.len();

		data.build(
			identifier.root_layer.clone(),
			sdf::Retiming::IDENTITY,
			&mut Vec::new(),
			is_muted,
		);

		data.compute_relocates();
		data
	}

	fn build(
		&mut self,
		layer: Arc<sdf::Layer>,
		offset: sdf::Retiming,
		ancestors: &mut Vec<String>,
		is_muted: &dyn Fn(&str) -> bool,
	) {
		self.layers.push(layer.clone());
		self.layer_offsets.push(offset);
		ancestors.push(layer.identifier().to_string());

		let sub_layers = layer.sub_layer_paths();
		let sub_layer_offsets = layer.sub_layer_offsets();

		for (i, sub_layer_path) in sub_layers.iter().enumerate() {
			self.sublayer_ids.insert(sub_layer_path.clone());

			if is_muted(sub_layer_path) {
				self.muted_layer_ids.insert(sub_layer_path.clone());
				continue;
			}

			if ancestors.contains(sub_layer_path) {
				self.local_errors.push(Error::SublayerCycle {
					layer: layer.identifier().to_string(),
					sublayer_path: sub_layer_path.clone(),
				});
				continue;
			}

			let Some(sub_layer) = ar::open_layer(sub_layer_path) else {
				self.local_errors.push(Error::InvalidSublayerPath {
					layer: layer.identifier().to_string(),
					sublayer_path: sub_layer_path.clone(),
				});
				continue;
			};

			// A layer appears once, at its strongest position.
			if self.layers.iter().any(|l| Arc::ptr_eq(l, &sub_layer)) {
				continue;
			}

			let sub_offset = sub_layer_offsets
				.get(i)
				.copied()
				.unwrap_or(sdf::Retiming::IDENTITY);
			self.build(sub_layer, offset * sub_offset, ancestors, is_muted);
		}

		ancestors.pop();
	}

	fn compute_relocates(&mut self) {
		for layer in &self.layers {
			for relocate in layer.relocates() {
				if relocate.source.is_empty() || relocate.target.is_empty() {
					continue;
				}
				if !self.relocates.iter().any(|(source, _)| *source == relocate.source) {
					self.relocates.push((relocate.source, relocate.target));
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn never_muted(_: &str) -> bool {
		false
	}

	#[test]
	fn builds_sublayers_with_offsets() {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		let sub = resolver.create_layer("sub.usda");
		let leaf = resolver.create_layer("leaf.usda");
		root.insert_sub_layer_path("sub.usda", sdf::Retiming::new(10.0, 1.0));
		sub.insert_sub_layer_path("leaf.usda", sdf::Retiming::new(5.0, 2.0));

		let id = LayerStackIdentifier::new(root.clone())
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		let stack = LayerStack::new(id, 0, &never_muted);

		assert_eq!(stack.layers().len(), 3);
		assert!(stack.local_errors().is_empty());
		assert_eq!(
			stack.layer_offset_for_layer(&leaf),
			Some(sdf::Retiming::new(15.0, 2.0))
		);
		assert!(stack.references_sublayer("leaf.usda"));
	}

	#[test]
	fn reports_missing_and_cyclic_sublayers() {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		let sub = resolver.create_layer("sub.usda");
		root.insert_sub_layer_path("sub.usda", sdf::Retiming::IDENTITY);
		root.insert_sub_layer_path("missing.usda", sdf::Retiming::IDENTITY);
		sub.insert_sub_layer_path("root.usda", sdf::Retiming::IDENTITY);

		let id = LayerStackIdentifier::new(root)
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		let stack = LayerStack::new(id, 0, &never_muted);

		assert_eq!(stack.layers().len(), 2);
		let errors = stack.local_errors();
		assert!(errors.contains(&Error::SublayerCycle {
			layer: "sub.usda".into(),
			sublayer_path: "root.usda".into(),
		}));
		assert!(errors.contains(&Error::InvalidSublayerPath {
			layer: "root.usda".into(),
			sublayer_path: "missing.usda".into(),
		}));
	}

	#[test]
	fn skips_muted_sublayers() {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		resolver.create_layer("sub.usda");
		root.insert_sub_layer_path("sub.usda", sdf::Retiming::IDENTITY);

		let id = LayerStackIdentifier::new(root)
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		let stack = LayerStack::new(id, 0, &|id: &str| id == "sub.usda");
		assert_eq!(stack.layers().len(), 1);
		assert_eq!(stack.muted_layers(), vec!["sub.usda".to_string()]);

		let dropped = stack.recompute(&never_muted);
		assert!(dropped.is_empty());
		assert_eq!(stack.layers().len(), 2);
	}
}
