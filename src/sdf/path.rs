use super::path_node::*;
use crate::tf;
use std::cmp::Ordering;

/// A path value used to locate objects in layers or scenegraphs.
///
/// Paths are interned: two equal paths share the same handles, so
/// comparison and hashing never touch the node pools.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Path {
	pub(super) prim: PoolHandle,
	pub(super) prop: PoolHandle,
}

impl Path {
	/// The empty path value.
	pub const fn empty_path() -> Self {
		Self {
			prim: INVALID_NODE_HANDLE,
			prop: INVALID_NODE_HANDLE,
		}
	}

	/// The absolute path representing the top of the namespace hierarchy.
	pub const fn absolute_root_path() -> Self {
		Self {
			prim: ABSOLUTE_ROOT_NODE_HANDLE,
			prop: INVALID_NODE_HANDLE,
		}
	}

	fn with_prim_node<R>(&self, f: impl FnOnce(&PathNode) -> R) -> Option<R> {
		let prim_pool = PATH_PRIM_PART_POOL.read();
		prim_pool.get(self.prim).map(f)
	}
}

/// Querying paths.
impl Path {
	/// Returns true if this path is the [`Self::empty_path`].
	pub fn is_empty(&self) -> bool {
		*self == Self::empty_path()
	}

	/// Returns true if this path is the [`Self::absolute_root_path`].
	pub fn is_absolute_root(&self) -> bool {
		*self == Self::absolute_root_path()
	}

	/// Returns whether the path identifies a prim.
	pub fn is_prim_path(&self) -> bool {
		self.prop == INVALID_NODE_HANDLE
			&& self
				.with_prim_node(|node| matches!(node.data, PathNodeData::Prim { .. }))
				.unwrap_or(false)
	}

	pub fn is_absolute_root_or_prim_path(&self) -> bool {
		self.is_absolute_root() || self.is_prim_path()
	}

	/// Returns whether the path identifies a variant selection for a prim.
	pub fn is_prim_variant_selection_path(&self) -> bool {
		self.prop == INVALID_NODE_HANDLE
			&& self
				.with_prim_node(|node| matches!(node.data, PathNodeData::PrimVariantSelection { .. }))
				.unwrap_or(false)
	}

	pub fn is_prim_or_prim_variant_selection_path(&self) -> bool {
		self.is_prim_path() || self.is_prim_variant_selection_path()
	}

	/// Returns whether the path identifies a prim's property.
	pub fn is_property_path(&self) -> bool {
		self.prop != INVALID_NODE_HANDLE
	}

	/// Returns whether any element of this path is a variant selection.
	pub fn contains_prim_variant_selection(&self) -> bool {
		self.with_prim_node(PathNode::contains_variant_selection)
			.unwrap_or(false)
	}

	/// Number of path elements, the absolute root counting as zero.
	pub fn element_count(&self) -> usize {
		let prim_count = self
			.with_prim_node(|node| node.element_count() as usize)
			.unwrap_or(0);
		prim_count + usize::from(self.prop != INVALID_NODE_HANDLE)
	}

	/// Return the path that identifies this path's namespace parent.
	pub fn parent_path(&self) -> Self {
		if self.is_empty() {
			return Self::empty_path();
		}

		// If this is a property path, trim that first.
		if self.prop != INVALID_NODE_HANDLE {
			return Self {
				prim: self.prim,
				prop: INVALID_NODE_HANDLE,
			};
		}

		Self {
			prim: self.with_prim_node(|node| node.parent).unwrap_or(INVALID_NODE_HANDLE),
			prop: INVALID_NODE_HANDLE,
		}
	}

	/// Returns the path with any property element removed.
	pub fn prim_or_prim_variant_selection_path(&self) -> Self {
		Self {
			prim: self.prim,
			prop: INVALID_NODE_HANDLE,
		}
	}

	/// Returns the owning prim path, dropping the property element and trailing variant selections.
	pub fn prim_path(&self) -> Self {
		let mut path = self.prim_or_prim_variant_selection_path();
		while path.is_prim_variant_selection_path() {
			path = path.parent_path();
		}
		path
	}

	/// Return a range for iterating over the ancestors of this path.
	///
	/// The range provides iteration over the prefixes of a path, ordered from longest to shortest.
	/// Starting with the path itself and ending with a single element path, not including the empty/root path.
	pub fn ancestors_range(&self) -> PathAncestorsRange {
		PathAncestorsRange { path: self.clone() }
	}

	/// Returns the name of the prim, property or variant identified by the path.
	pub fn name(&self) -> String {
		self.name_token().as_str().to_string()
	}

	pub fn name_token(&self) -> tf::Token {
		if self.prop != INVALID_NODE_HANDLE {
			let prop_pool = PATH_PROP_PART_POOL.read();
			if let Some(name) = prop_pool.get(self.prop).and_then(PathNode::name) {
				return name.clone();
			}
		}

		self.with_prim_node(|node| node.name().cloned())
			.flatten()
			.unwrap_or_default()
	}

	/// Returns the variant set and variant name when this is a variant selection path.
	pub fn variant_selection(&self) -> Option<(tf::Token, tf::Token)> {
		if self.prop != INVALID_NODE_HANDLE {
			return None;
		}
		self.with_prim_node(|node| match &node.data {
			PathNodeData::PrimVariantSelection {
				variant_set,
				variant_name,
			} => Some((variant_set.clone(), variant_name.clone())),
			_ => None,
		})
		.flatten()
	}

	/// Returns true if `prefix` is this path or one of its ancestors.
	///
	/// The empty path is never a prefix.
	pub fn has_prefix(&self, prefix: &Path) -> bool {
		if self.is_empty() || prefix.is_empty() {
			return false;
		}

		if prefix.prop != INVALID_NODE_HANDLE {
			return self == prefix;
		}

		let prim_pool = PATH_PRIM_PART_POOL.read();
		let Some(prefix_node) = prim_pool.get(prefix.prim) else {
			return false;
		};
		let prefix_count = prefix_node.element_count();

		let mut handle = self.prim;
		while let Some(node) = prim_pool.get(handle) {
			if node.element_count() < prefix_count {
				return false;
			}
			if handle == prefix.prim {
				return true;
			}
			handle = node.parent;
		}

		false
	}

	/// Returns a copy of this path with `old_prefix` replaced by `new_prefix`.
	///
	/// Paths that do not have `old_prefix` are returned unchanged.
	pub fn replace_prefix(&self, old_prefix: &Path, new_prefix: &Path) -> Path {
		if !self.has_prefix(old_prefix) {
			return self.clone();
		}

		if self == old_prefix {
			return new_prefix.clone();
		}

		if new_prefix.prop != INVALID_NODE_HANDLE || new_prefix.is_empty() {
			return Path::empty_path();
		}

		// Collect the prim elements below the old prefix, nearest first.
		let suffix = {
			let prim_pool = PATH_PRIM_PART_POOL.read();
			let mut suffix = Vec::new();
			let mut handle = self.prim;
			while handle != old_prefix.prim {
				let Some(node) = prim_pool.get(handle) else {
					return Path::empty_path();
				};
				suffix.push(node.data.clone());
				handle = node.parent;
			}
			suffix
		};

		let mut prim = new_prefix.prim;
		for data in suffix.iter().rev() {
			prim = find_or_create_path_node(&PATH_PRIM_PART_POOL, Some(prim), data);
		}

		Path {
			prim,
			prop: self.prop,
		}
	}

	/// Returns a copy of this path with every variant selection element removed.
	pub fn strip_all_variant_selections(&self) -> Path {
		if !self.contains_prim_variant_selection() {
			return self.clone();
		}

		let elements: Vec<PathNodeData> = {
			let prim_pool = PATH_PRIM_PART_POOL.read();
			prim_pool.elements(self.prim).into_iter().cloned().collect()
		};

		let mut prim = ABSOLUTE_ROOT_NODE_HANDLE;
		for data in &elements {
			if matches!(data, PathNodeData::Prim { .. }) {
				prim = find_or_create_path_node(&PATH_PRIM_PART_POOL, Some(prim), data);
			}
		}

		Path {
			prim,
			prop: self.prop,
		}
	}
}

/// Creating new paths by modifying existing paths.
impl Path {
	/// Creates a path by appending an element for `child_name` to this path.
	///
	/// This path must be a prim path, a variant selection path or the AbsoluteRootPath.
	pub fn append_child(&self, child_name: &tf::Token) -> Self {
		if self.prop != INVALID_NODE_HANDLE || self.is_empty() || child_name.is_empty() {
			return Self::empty_path();
		}

		Self {
			prim: find_or_create_path_node(
				&PATH_PRIM_PART_POOL,
				Some(self.prim),
				&PathNodeData::Prim {
					name: child_name.clone(),
				},
			),
			prop: INVALID_NODE_HANDLE,
		}
	}

	/// Creates a path by appending an element for `prop_name` to this path.
	///
	/// This path must be a prim path or a variant selection path.
	pub fn append_property(&self, prop_name: &tf::Token) -> Self {
		if self.prop != INVALID_NODE_HANDLE
			|| !self.is_prim_or_prim_variant_selection_path()
			|| prop_name.is_empty()
		{
			return Self::empty_path();
		}

		Self {
			prim: self.prim,
			prop: find_or_create_path_node(
				&PATH_PROP_PART_POOL,
				None,
				&PathNodeData::PrimProperty {
					name: prop_name.clone(),
				},
			),
		}
	}

	/// Creates a path by appending an element for `variant_set` and `variant` to this path.
	///
	/// This path must be a prim path or a variant selection path.
	pub fn append_variant_selection(&self, variant_set: &str, variant: &str) -> Self {
		if !self.is_prim_or_prim_variant_selection_path() || variant_set.is_empty() {
			return Self::empty_path();
		}

		Self {
			prim: find_or_create_path_node(
				&PATH_PRIM_PART_POOL,
				Some(self.prim),
				&PathNodeData::PrimVariantSelection {
					variant_set: tf::Token::new(variant_set),
					variant_name: tf::Token::new(variant),
				},
			),
			prop: INVALID_NODE_HANDLE,
		}
	}
}

impl Default for Path {
	fn default() -> Self {
		Self::empty_path()
	}
}

impl From<&str> for Path {
	fn from(s: &str) -> Self {
		super::path_parser::parse_path(s).unwrap_or_else(|_| Self::empty_path())
	}
}

impl std::fmt::Display for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let mut out = String::new();
		write_path_string(self.prim, self.prop, &mut out);
		f.write_str(&out)
	}
}

/// Paths order element-wise, so a path sorts directly before its descendants.
impl Ord for Path {
	fn cmp(&self, other: &Self) -> Ordering {
		if self == other {
			return Ordering::Equal;
		}

		let by_prim = if self.prim == other.prim {
			Ordering::Equal
		} else {
			let prim_pool = PATH_PRIM_PART_POOL.read();
			match (prim_pool.get(self.prim), prim_pool.get(other.prim)) {
				(None, None) => Ordering::Equal,
				(None, Some(_)) => Ordering::Less,
				(Some(_), None) => Ordering::Greater,
				(Some(_), Some(_)) => prim_pool.elements(self.prim).cmp(&prim_pool.elements(other.prim)),
			}
		};

		by_prim.then_with(|| {
			let prop_pool = PATH_PROP_PART_POOL.read();
			let lhs = prop_pool.get(self.prop).map(|node| &node.data);
			let rhs = prop_pool.get(other.prop).map(|node| &node.data);
			lhs.cmp(&rhs)
		})
	}
}

impl PartialOrd for Path {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

pub struct PathAncestorsRange {
	path: Path,
}

impl std::iter::Iterator for PathAncestorsRange {
	type Item = Path;

	fn next(&mut self) -> Option<Self::Item> {
		if self.path.is_empty() || self.path.is_absolute_root() {
			return None;
		}

		let current_path = self.path.clone();
		let parent = self.path.parent_path();
		self.path = if parent.is_absolute_root() {
			Path::empty_path()
		} else {
			parent
		};

		Some(current_path)
	}
}
