use crate::tf;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathNodeData {
	Root,
	Prim {
		name: tf::Token,
	},
	PrimVariantSelection {
		variant_set: tf::Token,
		variant_name: tf::Token,
	},
	PrimProperty {
		name: tf::Token,
	},
}

pub struct PathNode {
	pub parent: PoolHandle,
	element_count: u16,
	flags: u8,
	pub data: PathNodeData,
}

impl PathNode {
	pub const CONTAINS_VARIANT_SELECTION_FLAG: u8 = 1 << 0;

	pub fn contains_variant_selection(&self) -> bool {
		self.flags & Self::CONTAINS_VARIANT_SELECTION_FLAG != 0
	}

	pub fn element_count(&self) -> u16 {
		self.element_count
	}

	pub fn name(&self) -> Option<&tf::Token> {
		match &self.data {
			PathNodeData::Root => None,
			PathNodeData::Prim { name } => Some(name),
			PathNodeData::PrimProperty { name } => Some(name),
			PathNodeData::PrimVariantSelection {
				variant_set,
				variant_name,
			} => {
				if variant_name.is_empty() {
					Some(variant_set)
				} else {
					Some(variant_name)
				}
			}
		}
	}
}

/// Handles are indices into an append-only pool; nodes are interned and never freed.
pub type PoolHandle = u32;

pub const ABSOLUTE_ROOT_NODE_HANDLE: PoolHandle = 0;
pub const INVALID_NODE_HANDLE: PoolHandle = u32::MAX;

pub struct Pool {
	elements: Vec<PathNode>,
	lookup: HashMap<(PoolHandle, PathNodeData), PoolHandle>,
}

impl Pool {
	fn new() -> Self {
		Pool {
			elements: Vec::new(),
			lookup: HashMap::new(),
		}
	}

	fn insert(&mut self, node: PathNode) -> PoolHandle {
		let handle = self.elements.len() as PoolHandle;
		self.lookup.insert((node.parent, node.data.clone()), handle);
		self.elements.push(node);
		handle
	}

	pub fn get(&self, handle: PoolHandle) -> Option<&PathNode> {
		self.elements.get(handle as usize)
	}

	/// Element data from the top of the hierarchy down to `handle`, root excluded.
	pub fn elements(&self, mut handle: PoolHandle) -> Vec<&PathNodeData> {
		let mut out = Vec::new();
		while let Some(node) = self.get(handle) {
			if !matches!(node.data, PathNodeData::Root) {
				out.push(&node.data);
			}
			handle = node.parent;
		}
		out.reverse();
		out
	}
}

pub static PATH_PRIM_PART_POOL: LazyLock<RwLock<Pool>> = LazyLock::new(|| {
	let mut pool = Pool::new();

	pool.insert(PathNode {
		parent: INVALID_NODE_HANDLE,
		element_count: 0,
		flags: 0,
		data: PathNodeData::Root,
	});

	RwLock::new(pool)
});

pub static PATH_PROP_PART_POOL: LazyLock<RwLock<Pool>> = LazyLock::new(|| RwLock::new(Pool::new()));

pub fn find_or_create_path_node(
	pool: &'static LazyLock<RwLock<Pool>>,
	parent: Option<PoolHandle>,
	data: &PathNodeData,
) -> PoolHandle {
	let parent = parent.unwrap_or(INVALID_NODE_HANDLE);
	let key = (parent, data.clone());

	if let Some(&handle) = pool.read().lookup.get(&key) {
		return handle;
	}

	let mut w_pool = pool.write();

	// Another thread may have interned the node between the two locks.
	if let Some(&handle) = w_pool.lookup.get(&key) {
		return handle;
	}

	let parent_node = w_pool.get(parent);
	let mut flags = parent_node.map_or(0, |p| p.flags);
	if matches!(data, PathNodeData::PrimVariantSelection { .. }) {
		flags |= PathNode::CONTAINS_VARIANT_SELECTION_FLAG;
	}

	let node = PathNode {
		parent,
		element_count: parent_node.map_or(0, |p| p.element_count) + 1,
		flags,
		data: key.1,
	};

	w_pool.insert(node)
}

pub fn write_path_string(prim_part: PoolHandle, prop_part: PoolHandle, out: &mut String) {
	if prim_part == INVALID_NODE_HANDLE {
		return;
	}

	let prim_pool = PATH_PRIM_PART_POOL.read();
	let elements = prim_pool.elements(prim_part);

	if elements.is_empty() {
		out.push('/');
	}

	let mut previous_was_variant = false;
	for data in elements {
		match data {
			PathNodeData::Prim { name } => {
				if !previous_was_variant {
					out.push('/');
				}
				out.push_str(name.as_str());
				previous_was_variant = false;
			}
			PathNodeData::PrimVariantSelection {
				variant_set,
				variant_name,
			} => {
				out.push('{');
				out.push_str(variant_set.as_str());
				out.push('=');
				out.push_str(variant_name.as_str());
				out.push('}');
				previous_was_variant = true;
			}
			_ => {}
		}
	}
	drop(prim_pool);

	if prop_part != INVALID_NODE_HANDLE {
		let prop_pool = PATH_PROP_PART_POOL.read();
		if let Some(name) = prop_pool.get(prop_part).and_then(PathNode::name) {
			out.push('.');
			out.push_str(name.as_str());
		}
	}
}
