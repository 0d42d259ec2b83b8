use super::ArcType;
use super::layer_stack::LayerStack;
use super::map_function::MapFunction;
use crate::sdf;
use std::sync::Arc;

// Index used to represent an invalid node.
pub const INVALID_NODE_INDEX: u16 = u16::MAX;

#[derive(Debug, Clone)]
pub struct Node {
	pub layer_stack: Arc<LayerStack>,

	pub parent_index: u16,
	pub origin_index: u16,

	// The indices of the first/last child, previous/next sibling.
	// The previous sibling index of a first child and the next
	// sibling index of a last child are `INVALID_NODE_INDEX`
	// (i.e. they form a list, not a ring).
	pub first_child_index: u16,
	pub last_child_index: u16,
	pub prev_sibling_index: u16,
	pub next_sibling_index: u16,

	pub arc_type: ArcType,
	pub map_to_parent: MapFunction,
	pub map_to_root: MapFunction,

	pub has_specs: bool,
	pub is_inert: bool,
	pub is_culled: bool,
	/// Set when the arc was authored on an ancestor of the node's site.
	pub is_due_to_ancestor: bool,
}

impl Node {
	pub fn new(
		layer_stack: Arc<LayerStack>,
		parent_index: u16,
		origin_index: u16,
		arc_type: ArcType,
		map_to_parent: MapFunction,
	) -> Self {
		Self {
			layer_stack,
			parent_index,
			origin_index,
			first_child_index: INVALID_NODE_INDEX,
			last_child_index: INVALID_NODE_INDEX,
			prev_sibling_index: INVALID_NODE_INDEX,
			next_sibling_index: INVALID_NODE_INDEX,
			arc_type,
			map_to_root: map_to_parent.clone(),
			map_to_parent,
			has_specs: false,
			is_inert: false,
			is_culled: false,
			is_due_to_ancestor: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct UnsharedData {
	pub site_path: sdf::Path,
}

#[derive(Debug, Clone, Default)]
pub struct PrimIndexGraph {
	pub nodes: Vec<Node>,
	pub unshared: Vec<UnsharedData>,
}

impl PrimIndexGraph {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn add_node(&mut self, node: Node, site_path: sdf::Path) -> u16 {
		let index = self.nodes.len();
		self.nodes.push(node);
		self.unshared.push(UnsharedData { site_path });
		index as u16
	}

	pub fn get_node(&self, index: u16) -> Option<&Node> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.nodes.get(index as usize)
		}
	}

	pub fn get_node_mut(&mut self, index: u16) -> Option<&mut Node> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.nodes.get_mut(index as usize)
		}
	}

	pub fn get_unshared(&self, index: u16) -> Option<&UnsharedData> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.unshared.get(index as usize)
		}
	}

	/// Adds `node` below `parent_idx`, keeping siblings in strength order.
	///
	/// The child's map to root is composed from the parent's.
	pub fn add_child(&mut self, parent_idx: u16, mut node: Node, site_path: sdf::Path) -> u16 {
		node.map_to_root = self.nodes[parent_idx as usize]
			.map_to_root
			.compose(&node.map_to_parent);

		let arc_type = node.arc_type;
		let child_idx = self.add_node(node, site_path);

		// Weaker arcs go later; equal arcs keep authored order.
		let mut insert_after = INVALID_NODE_INDEX;
		let mut current = self.nodes[parent_idx as usize].first_child_index;

		while current != INVALID_NODE_INDEX {
			let current_arc = self.nodes[current as usize].arc_type;
			if arc_strength(arc_type) < arc_strength(current_arc) {
				break;
			}
			insert_after = current;
			current = self.nodes[current as usize].next_sibling_index;
		}

		if insert_after == INVALID_NODE_INDEX {
			let old_first = self.nodes[parent_idx as usize].first_child_index;
			self.nodes[parent_idx as usize].first_child_index = child_idx;
			if old_first != INVALID_NODE_INDEX {
				self.nodes[old_first as usize].prev_sibling_index = child_idx;
				self.nodes[child_idx as usize].next_sibling_index = old_first;
			} else {
				self.nodes[parent_idx as usize].last_child_index = child_idx;
			}
		} else {
			let next = self.nodes[insert_after as usize].next_sibling_index;
			self.nodes[insert_after as usize].next_sibling_index = child_idx;
			self.nodes[child_idx as usize].prev_sibling_index = insert_after;
			self.nodes[child_idx as usize].next_sibling_index = next;
			if next != INVALID_NODE_INDEX {
				self.nodes[next as usize].prev_sibling_index = child_idx;
			} else {
				self.nodes[parent_idx as usize].last_child_index = child_idx;
			}
		}

		child_idx
	}

	pub fn children(&self, node_idx: u16) -> Vec<u16> {
		let mut indices = Vec::new();
		if let Some(node) = self.get_node(node_idx) {
			let mut current = node.first_child_index;
			while current != INVALID_NODE_INDEX {
				indices.push(current);
				current = self.nodes[current as usize].next_sibling_index;
			}
		}
		indices
	}

	/// Node indices from strongest to weakest.
	pub fn strength_order(&self) -> Vec<u16> {
		let mut order = Vec::with_capacity(self.nodes.len());
		if self.nodes.is_empty() {
			return order;
		}

		let mut stack = vec![0u16];
		while let Some(idx) = stack.pop() {
			order.push(idx);
			let mut children = self.children(idx);
			children.reverse();
			stack.extend(children);
		}
		order
	}

	/// Returns whether `node_idx` or any node beneath it has specs.
	pub fn subtree_has_specs(&self, node_idx: u16) -> bool {
		self.nodes[node_idx as usize].has_specs
			|| self
				.children(node_idx)
				.into_iter()
				.any(|child| self.subtree_has_specs(child))
	}

	pub fn mark_subtree_culled(&mut self, node_idx: u16) {
		self.nodes[node_idx as usize].is_culled = true;
		for child in self.children(node_idx) {
			self.mark_subtree_culled(child);
		}
	}

	/// Rebuilds the graph without culled nodes, keeping strength order.
	pub fn remove_culled_nodes(&mut self) {
		if !self.nodes.iter().any(|node| node.is_culled) {
			return;
		}

		let mut remap = vec![INVALID_NODE_INDEX; self.nodes.len()];
		let mut compacted = PrimIndexGraph::new();

		for idx in self.strength_order() {
			let node = &self.nodes[idx as usize];
			if node.is_culled {
				continue;
			}

			let mut copy = node.clone();
			copy.parent_index = if node.parent_index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				remap[node.parent_index as usize]
			};
			copy.first_child_index = INVALID_NODE_INDEX;
			copy.last_child_index = INVALID_NODE_INDEX;
			copy.prev_sibling_index = INVALID_NODE_INDEX;
			copy.next_sibling_index = INVALID_NODE_INDEX;

			let site_path = self.unshared[idx as usize].site_path.clone();
			let new_idx = compacted.add_node(copy, site_path);
			remap[idx as usize] = new_idx;

			// Strength order visits siblings strongest first, so appending keeps order.
			let parent = compacted.nodes[new_idx as usize].parent_index;
			if parent != INVALID_NODE_INDEX {
				let last = compacted.nodes[parent as usize].last_child_index;
				if last == INVALID_NODE_INDEX {
					compacted.nodes[parent as usize].first_child_index = new_idx;
				} else {
					compacted.nodes[last as usize].next_sibling_index = new_idx;
					compacted.nodes[new_idx as usize].prev_sibling_index = last;
				}
				compacted.nodes[parent as usize].last_child_index = new_idx;
			}
		}

		// Origins may be weaker than the nodes they introduce.
		for (old_idx, node) in self.nodes.iter().enumerate() {
			let new_idx = remap[old_idx];
			if new_idx != INVALID_NODE_INDEX && node.origin_index != INVALID_NODE_INDEX {
				compacted.nodes[new_idx as usize].origin_index = remap[node.origin_index as usize];
			}
		}

		*self = compacted;
	}
}

/// Returns the strength value for a given arc type (lower = stronger)
/// LIVERPS order: Local(0), Inherit(1), Variant(2), Relocate(3), Reference(4), Payload(5), Specialize(6)
fn arc_strength(arc: ArcType) -> u8 {
	match arc {
		ArcType::Local => 0,
		ArcType::Inherit => 1,
		ArcType::Variant => 2,
		ArcType::Relocate => 3,
		ArcType::Reference => 4,
		ArcType::Payload => 5,
		ArcType::Specialize => 6,
	}
}
