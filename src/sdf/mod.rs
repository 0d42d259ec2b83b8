//! Scene Description Foundations

mod layer;
mod path;
mod path_node;
mod path_parser;
mod retiming;

pub use layer::*;
pub use path::*;
pub use path_parser::ParseError;
pub use retiming::*;

/// An enum that identifies the possible specifiers for a PrimSpec.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Specifier {
	Def,
	#[default]
	Over,
	Class,
}

/// Represents a reference and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reference {
	/// The asset path to the external layer. Empty for internal references.
	pub asset_path: String,
	/// The path to the referenced prim in the external layer.
	/// Empty to target the layer's default prim.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
}

impl Reference {
	pub fn new(asset_path: impl Into<String>, prim_path: impl Into<Path>) -> Self {
		Self {
			asset_path: asset_path.into(),
			prim_path: prim_path.into(),
			layer_offset: Retiming::IDENTITY,
		}
	}

	pub fn is_internal(&self) -> bool {
		self.asset_path.is_empty()
	}
}

/// Represents a payload and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Payload {
	/// The asset path to the external layer. Empty for internal payloads.
	pub asset_path: String,
	/// The root prim path to the referenced prim in the external layer.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
}

impl Payload {
	pub fn new(asset_path: impl Into<String>, prim_path: impl Into<Path>) -> Self {
		Self {
			asset_path: asset_path.into(),
			prim_path: prim_path.into(),
			layer_offset: Retiming::IDENTITY,
		}
	}
}

/// A single relocate specifying a source and target path for a relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocate {
	pub source: Path,
	pub target: Path,
}

impl Relocate {
	pub fn new(source: impl Into<Path>, target: impl Into<Path>) -> Self {
		Self {
			source: source.into(),
			target: target.into(),
		}
	}
}
