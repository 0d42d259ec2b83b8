use super::error::Error;
use super::prim_index::PrimIndex;
use crate::sdf;
use std::sync::Arc;

/// A layer and the path of a property spec in it.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySite {
	pub layer: Arc<sdf::Layer>,
	pub path: sdf::Path,
}

/// The property specs contributing to a property, strongest first.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndex {
	pub(crate) property_stack: Vec<PropertySite>,
	pub(crate) local_errors: Vec<Error>,
}

impl PropertyIndex {
	/// Builds the property index for `path` from the index of its owning prim.
	pub fn build(path: &sdf::Path, prim_index: &PrimIndex) -> Self {
		let name = path.name_token();
		let mut property_stack = Vec::new();

		for node in prim_index.nodes().filter(|node| !node.is_inert()) {
			let site_path = node.path().append_property(&name);
			if site_path.is_empty() {
				continue;
			}
			for layer in node.layer_stack().layers() {
				if layer.has_spec(&site_path) {
					property_stack.push(PropertySite {
						layer,
						path: site_path.clone(),
					});
				}
			}
		}

		Self {
			property_stack,
			local_errors: Vec::new(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.property_stack.is_empty()
	}

	pub fn property_stack(&self) -> &[PropertySite] {
		&self.property_stack
	}

	pub fn local_errors(&self) -> &[Error] {
		&self.local_errors
	}

	/// An index with no opinions.
	pub fn empty() -> &'static PropertyIndex {
		static EMPTY: PropertyIndex = PropertyIndex {
			property_stack: Vec::new(),
			local_errors: Vec::new(),
		};
		&EMPTY
	}
}
