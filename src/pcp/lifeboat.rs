use super::layer_stack::LayerStack;
use super::prim_index::PrimIndex;
use super::property_index::PropertyIndex;
use crate::sdf;
use std::sync::Arc;

/// Keeps state removed from a cache alive until a round of change
/// processing is over.
///
/// [`super::Cache::apply`] moves everything it removes here. The state is
/// released when the lifeboat is cleared or dropped.
#[derive(Debug, Default)]
pub struct Lifeboat {
	layer_stacks: Vec<Arc<LayerStack>>,
	layers: Vec<Arc<sdf::Layer>>,
	prim_indexes: Vec<Arc<PrimIndex>>,
	property_indexes: Vec<PropertyIndex>,
}

impl Lifeboat {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn retain_layer_stack(&mut self, layer_stack: Arc<LayerStack>) {
		self.layer_stacks.push(layer_stack);
	}

	pub fn retain_layer(&mut self, layer: Arc<sdf::Layer>) {
		self.layers.push(layer);
	}

	pub fn retain_prim_index(&mut self, prim_index: Arc<PrimIndex>) {
		self.prim_indexes.push(prim_index);
	}

	pub fn retain_property_index(&mut self, property_index: PropertyIndex) {
		self.property_indexes.push(property_index);
	}

	pub fn layer_stacks(&self) -> &[Arc<LayerStack>] {
		&self.layer_stacks
	}

	pub fn layers(&self) -> &[Arc<sdf::Layer>] {
		&self.layers
	}

	pub fn prim_indexes(&self) -> &[Arc<PrimIndex>] {
		&self.prim_indexes
	}

	pub fn is_empty(&self) -> bool {
		self.layer_stacks.is_empty()
			&& self.layers.is_empty()
			&& self.prim_indexes.is_empty()
			&& self.property_indexes.is_empty()
	}

	pub fn clear(&mut self) {
		if !self.is_empty() {
			tracing::trace!(
				layer_stacks = self.layer_stacks.len(),
				prim_indexes = self.prim_indexes.len(),
				"releasing lifeboat"
			);
		}
		self.layer_stacks.clear();
		self.layers.clear();
		self.prim_indexes.clear();
		self.property_indexes.clear();
	}

	pub fn swap(&mut self, other: &mut Lifeboat) {
		std::mem::swap(self, other);
	}
}

impl Drop for Lifeboat {
	fn drop(&mut self) {
		self.clear();
	}
}
