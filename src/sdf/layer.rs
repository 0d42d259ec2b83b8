use crate::{sdf, tf};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opinions authored on a single prim or variant.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PrimSpec {
	pub specifier: sdf::Specifier,
	pub references: Vec<sdf::Reference>,
	pub payloads: Vec<sdf::Payload>,
	pub inherits: Vec<sdf::Path>,
	pub specializes: Vec<sdf::Path>,
	/// Names of the variant sets authored on this prim, in authored order.
	pub variant_sets: Vec<tf::Token>,
	pub variant_selections: BTreeMap<tf::Token, tf::Token>,
	pub children: Vec<tf::Token>,
	pub properties: Vec<tf::Token>,
}

impl PrimSpec {
	/// Returns whether the spec introduces any composition arcs.
	pub fn has_arcs(&self) -> bool {
		!self.references.is_empty()
			|| !self.payloads.is_empty()
			|| !self.inherits.is_empty()
			|| !self.specializes.is_empty()
			|| !self.variant_sets.is_empty()
	}
}

#[derive(Debug, Default, Clone, PartialEq)]
struct LayerData {
	sub_layers: Vec<String>,
	sub_layer_offsets: Vec<sdf::Retiming>,
	relocates: Vec<sdf::Relocate>,
	default_prim: tf::Token,
	specs: HashMap<sdf::Path, PrimSpec>,
}

/// A scene description container that can combine with other such containers
/// to form simple component assets, and successively larger aggregates.
///
/// Layers live in memory. [`Layer::save`] records the current content and
/// [`Layer::reload`] reverts to the last saved content.
pub struct Layer {
	identifier: String,
	data: RwLock<LayerData>,
	saved: RwLock<LayerData>,
}

impl std::fmt::Debug for Layer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Layer")
			.field("identifier", &self.identifier)
			.finish()
	}
}

impl PartialEq for Layer {
	fn eq(&self, other: &Self) -> bool {
		self.identifier == other.identifier
	}
}

impl Eq for Layer {}

impl std::hash::Hash for Layer {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.identifier.hash(state);
	}
}

impl PartialOrd for Layer {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Layer {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.identifier.cmp(&other.identifier)
	}
}

impl Layer {
	pub fn new(identifier: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			identifier: identifier.into(),
			data: RwLock::new(LayerData::default()),
			saved: RwLock::new(LayerData::default()),
		})
	}

	/// Creates a layer with a unique identifier that no resolver knows about.
	pub fn create_anonymous(tag: &str) -> Arc<Self> {
		static NEXT_ANONYMOUS_ID: AtomicU64 = AtomicU64::new(0);
		let id = NEXT_ANONYMOUS_ID.fetch_add(1, Ordering::Relaxed);
		Self::new(format!("anon:{id:08x}:{tag}"))
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	pub fn is_anonymous(&self) -> bool {
		self.identifier.starts_with("anon:")
	}

	/// Records the current content as the state [`Self::reload`] returns to.
	pub fn save(&self) {
		*self.saved.write() = self.data.read().clone();
	}

	pub fn is_dirty(&self) -> bool {
		*self.saved.read() != *self.data.read()
	}

	/// Reverts to the last saved content. Returns true if anything changed.
	pub fn reload(&self) -> bool {
		let saved = self.saved.read().clone();
		let mut data = self.data.write();
		if *data == saved {
			return false;
		}
		*data = saved;
		true
	}

	/// Reloads every layer in `layers`, returning the ones whose content changed.
	pub fn reload_layers<'a>(layers: impl IntoIterator<Item = &'a Arc<Layer>>) -> Vec<Arc<Layer>> {
		layers
			.into_iter()
			.filter(|layer| layer.reload())
			.cloned()
			.collect()
	}
}

/// Metadata
impl Layer {
	/// Return this layer's 'defaultPrim' metadata.
	pub fn default_prim(&self) -> tf::Token {
		self.data.read().default_prim.clone()
	}

	pub fn set_default_prim(&self, name: &str) {
		self.data.write().default_prim = tf::Token::new(name);
	}

	/// Return this layer's 'defaultPrim' metadata interpreted as an absolute prim path.
	pub fn default_prim_as_path(&self) -> sdf::Path {
		let default_prim_token = self.default_prim();
		if default_prim_token.is_empty() {
			return sdf::Path::empty_path();
		}

		if default_prim_token.as_str().starts_with('/') {
			sdf::Path::from(default_prim_token.as_str())
		} else {
			sdf::Path::absolute_root_path().append_child(&default_prim_token)
		}
	}
}

/// Sublayers
impl Layer {
	pub fn sub_layer_paths(&self) -> Vec<String> {
		self.data.read().sub_layers.clone()
	}

	pub fn sub_layer_offsets(&self) -> Vec<sdf::Retiming> {
		self.data.read().sub_layer_offsets.clone()
	}

	/// Appends a sublayer, weaker than those already present.
	pub fn insert_sub_layer_path(&self, identifier: &str, offset: sdf::Retiming) {
		let mut data = self.data.write();
		let count = data.sub_layers.len();
		data.sub_layer_offsets.resize(count, sdf::Retiming::IDENTITY);
		data.sub_layers.push(identifier.to_string());
		data.sub_layer_offsets.push(offset);
	}

	pub fn remove_sub_layer_path(&self, identifier: &str) {
		let mut data = self.data.write();
		if let Some(index) = data.sub_layers.iter().position(|id| id == identifier) {
			data.sub_layers.remove(index);
			if index < data.sub_layer_offsets.len() {
				data.sub_layer_offsets.remove(index);
			}
		}
	}
}

/// Relocates
impl Layer {
	pub fn relocates(&self) -> Vec<sdf::Relocate> {
		self.data.read().relocates.clone()
	}

	pub fn add_relocate(&self, relocate: sdf::Relocate) {
		self.data.write().relocates.push(relocate);
	}
}

/// Specs
impl Layer {
	/// Creates a spec at `path` and over specs for any missing ancestors.
	///
	/// `path` must be a prim or variant selection path. An existing spec keeps
	/// its opinions and only has its specifier updated.
	pub fn define_prim(&self, path: &sdf::Path, specifier: sdf::Specifier) -> bool {
		if !path.is_prim_or_prim_variant_selection_path() {
			return false;
		}

		let mut data = self.data.write();
		Self::create_spec(&mut data, path).specifier = specifier;
		true
	}

	fn create_spec<'a>(data: &'a mut LayerData, path: &sdf::Path) -> &'a mut PrimSpec {
		if !data.specs.contains_key(path) {
			let parent = path.parent_path();
			if parent.is_prim_or_prim_variant_selection_path() {
				let parent_spec = Self::create_spec(data, &parent);
				if let Some((variant_set, _)) = path.variant_selection() {
					if !parent_spec.variant_sets.contains(&variant_set) {
						parent_spec.variant_sets.push(variant_set);
					}
				} else {
					parent_spec.children.push(path.name_token());
				}
			} else if parent.is_absolute_root() {
				let root = data.specs.entry(parent).or_default();
				root.children.push(path.name_token());
			}
			data.specs.insert(path.clone(), PrimSpec::default());
		}

		data.specs.entry(path.clone()).or_default()
	}

	/// Runs `f` on the spec at `path`, creating it as an over if needed.
	pub fn edit_prim<R>(&self, path: &sdf::Path, f: impl FnOnce(&mut PrimSpec) -> R) -> Option<R> {
		if !path.is_prim_or_prim_variant_selection_path() {
			return None;
		}
		let mut data = self.data.write();
		Some(f(Self::create_spec(&mut data, path)))
	}

	pub fn add_reference(&self, path: &sdf::Path, reference: sdf::Reference) {
		self.edit_prim(path, |spec| spec.references.push(reference));
	}

	pub fn add_payload(&self, path: &sdf::Path, payload: sdf::Payload) {
		self.edit_prim(path, |spec| spec.payloads.push(payload));
	}

	pub fn add_inherit(&self, path: &sdf::Path, class_path: &sdf::Path) {
		self.edit_prim(path, |spec| spec.inherits.push(class_path.clone()));
	}

	pub fn add_specialize(&self, path: &sdf::Path, base_path: &sdf::Path) {
		self.edit_prim(path, |spec| spec.specializes.push(base_path.clone()));
	}

	pub fn set_variant_selection(&self, path: &sdf::Path, variant_set: &str, variant: &str) {
		self.edit_prim(path, |spec| {
			spec.variant_selections
				.insert(tf::Token::new(variant_set), tf::Token::new(variant))
		});
	}

	/// Defines the variant `variant_set=variant` under the prim at `path`.
	pub fn define_variant(&self, path: &sdf::Path, variant_set: &str, variant: &str) -> sdf::Path {
		let variant_path = path.append_variant_selection(variant_set, variant);
		self.define_prim(&variant_path, sdf::Specifier::Over);
		variant_path
	}

	/// Creates a property spec; `path` must be a property path.
	pub fn create_property(&self, path: &sdf::Path) -> bool {
		if !path.is_property_path() {
			return false;
		}

		let name = path.name_token();
		self.edit_prim(&path.prim_or_prim_variant_selection_path(), |spec| {
			if !spec.properties.contains(&name) {
				spec.properties.push(name);
			}
		})
		.is_some()
	}

	/// Removes the spec at `path` together with everything beneath it.
	pub fn remove_spec(&self, path: &sdf::Path) -> bool {
		let mut data = self.data.write();

		if path.is_property_path() {
			let name = path.name_token();
			return match data.specs.get_mut(&path.prim_or_prim_variant_selection_path()) {
				Some(spec) => {
					let count = spec.properties.len();
					spec.properties.retain(|n| *n != name);
					count != spec.properties.len()
				}
				None => false,
			};
		}

		if data.specs.remove(path).is_none() {
			return false;
		}
		data.specs.retain(|p, _| !p.has_prefix(path));

		let parent = path.parent_path();
		if let Some((variant_set, _)) = path.variant_selection() {
			let set_still_used = data.specs.keys().any(|p| {
				p.parent_path() == parent && p.variant_selection().is_some_and(|(set, _)| set == variant_set)
			});
			if !set_still_used && let Some(parent_spec) = data.specs.get_mut(&parent) {
				parent_spec.variant_sets.retain(|n| *n != variant_set);
			}
		} else if let Some(parent_spec) = data.specs.get_mut(&parent) {
			let name = path.name_token();
			parent_spec.children.retain(|n| *n != name);
		}
		true
	}

	/// Returns a copy of the spec authored at `path`.
	pub fn prim_spec(&self, path: &sdf::Path) -> Option<PrimSpec> {
		self.data.read().specs.get(path).cloned()
	}

	pub fn has_spec(&self, path: &sdf::Path) -> bool {
		let data = self.data.read();
		if path.is_property_path() {
			let name = path.name_token();
			return data
				.specs
				.get(&path.prim_or_prim_variant_selection_path())
				.is_some_and(|spec| spec.properties.contains(&name));
		}
		!path.is_absolute_root() && data.specs.contains_key(path)
	}

	pub fn prim_children(&self, path: &sdf::Path) -> Vec<tf::Token> {
		self.data
			.read()
			.specs
			.get(path)
			.map(|spec| spec.children.clone())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn define_creates_ancestors() {
		let layer = Layer::new("test.usda");
		layer.define_prim(&p("/A/B/C"), sdf::Specifier::Def);

		assert!(layer.has_spec(&p("/A")));
		assert!(layer.has_spec(&p("/A/B")));
		assert_eq!(layer.prim_spec(&p("/A/B")).unwrap().specifier, sdf::Specifier::Over);
		assert_eq!(layer.prim_children(&p("/A")), vec![tf::Token::new("B")]);
		assert_eq!(
			layer.prim_children(&sdf::Path::absolute_root_path()),
			vec![tf::Token::new("A")]
		);
	}

	#[test]
	fn remove_spec_removes_subtree() {
		let layer = Layer::new("test.usda");
		layer.define_prim(&p("/A/B/C"), sdf::Specifier::Def);
		layer.create_property(&p("/A/B.size"));
		assert!(layer.has_spec(&p("/A/B.size")));

		assert!(layer.remove_spec(&p("/A/B")));
		assert!(!layer.has_spec(&p("/A/B/C")));
		assert!(!layer.has_spec(&p("/A/B.size")));
		assert!(layer.prim_children(&p("/A")).is_empty());
		assert!(!layer.remove_spec(&p("/A/B")));
	}

	#[test]
	fn variants_register_their_set() {
		let layer = Layer::new("test.usda");
		let variant = layer.define_variant(&p("/A"), "look", "red");
		assert_eq!(variant, p("/A{look=red}"));
		assert_eq!(
			layer.prim_spec(&p("/A")).unwrap().variant_sets,
			vec![tf::Token::new("look")]
		);
	}

	#[test]
	fn reload_reverts_to_saved_content() {
		let layer = Layer::new("test.usda");
		layer.define_prim(&p("/A"), sdf::Specifier::Def);
		layer.save();
		assert!(!layer.is_dirty());

		layer.define_prim(&p("/B"), sdf::Specifier::Def);
		assert!(layer.is_dirty());
		assert!(layer.reload());
		assert!(!layer.has_spec(&p("/B")));
		assert!(!layer.reload());
	}
}
