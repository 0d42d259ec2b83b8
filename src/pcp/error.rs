use super::ArcType;
use super::layer_stack::LayerStackIdentifier;
use crate::sdf;

/// A path within a specific layer stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Site {
	pub layer_stack: LayerStackIdentifier,
	pub path: sdf::Path,
}

impl Site {
	pub fn new(layer_stack: LayerStackIdentifier, path: sdf::Path) -> Self {
		Self { layer_stack, path }
	}
}

impl std::fmt::Display for Site {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "@{}@<{}>", self.layer_stack.root_layer.identifier(), self.path)
	}
}

/// Composition errors.
///
/// These never abort composition. They are stored on the layer stack or
/// prim index that produced them and reported to the caller of the
/// computation that produced them.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
	#[error("could not load sublayer @{sublayer_path}@ of layer @{layer}@")]
	InvalidSublayerPath { layer: String, sublayer_path: String },

	#[error("sublayer @{sublayer_path}@ of layer @{layer}@ forms a cycle")]
	SublayerCycle { layer: String, sublayer_path: String },

	#[error("could not open asset @{asset_path}@ for {arc_type:?} arc on {site}, authored in @{source_layer}@")]
	InvalidAssetPath {
		site: Site,
		source_layer: String,
		asset_path: String,
		arc_type: ArcType,
	},

	#[error("asset @{asset_path}@ for {arc_type:?} arc on {site} is muted")]
	MutedAssetPath {
		site: Site,
		source_layer: String,
		asset_path: String,
		arc_type: ArcType,
	},

	#[error("{arc_type:?} arc on {site} targets <{target_path}> which has no opinions in @{target_layer}@")]
	UnresolvedPrimPath {
		site: Site,
		target_layer: String,
		target_path: sdf::Path,
		arc_type: ArcType,
	},

	#[error("{arc_type:?} arc on {site} to <{target_path}> introduces a cycle")]
	ArcCycle {
		site: Site,
		target_path: sdf::Path,
		arc_type: ArcType,
	},

	#[error("opinions at relocation source {site} are ignored")]
	OpinionAtRelocationSource { site: Site },
}

impl Error {
	/// Returns the site the error was reported for, if it has one.
	pub fn site(&self) -> Option<&Site> {
		match self {
			Error::InvalidAssetPath { site, .. }
			| Error::MutedAssetPath { site, .. }
			| Error::UnresolvedPrimPath { site, .. }
			| Error::ArcCycle { site, .. }
			| Error::OpinionAtRelocationSource { site } => Some(site),
			Error::InvalidSublayerPath { .. } | Error::SublayerCycle { .. } => None,
		}
	}
}
