use crate::sdf;
use rayon::prelude::*;
use std::collections::{HashMap, hash_map};

#[derive(Debug, Clone)]
struct Entry<V> {
	value: V,
	children: Vec<sdf::Path>,
}

/// A table keyed by path that keeps track of the namespace hierarchy of
/// its keys, so whole subtrees can be visited or erased at once.
///
/// Inserting a path also inserts default values for its missing ancestors.
#[derive(Debug, Clone)]
pub struct PathTable<V> {
	entries: HashMap<sdf::Path, Entry<V>>,
}

impl<V> Default for PathTable<V> {
	fn default() -> Self {
		Self {
			entries: HashMap::new(),
		}
	}
}

impl<V> PathTable<V> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn get(&self, path: &sdf::Path) -> Option<&V> {
		self.entries.get(path).map(|entry| &entry.value)
	}

	pub fn get_mut(&mut self, path: &sdf::Path) -> Option<&mut V> {
		self.entries.get_mut(path).map(|entry| &mut entry.value)
	}

	pub fn contains_key(&self, path: &sdf::Path) -> bool {
		self.entries.contains_key(path)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&sdf::Path, &V)> {
		self.entries.iter().map(|(path, entry)| (path, &entry.value))
	}

	/// Visits `path` and every path beneath it, parents before children.
	pub fn subtree<'a>(&'a self, path: &sdf::Path) -> Vec<(&'a sdf::Path, &'a V)> {
		let mut result = Vec::new();
		let Some((key, _)) = self.entries.get_key_value(path) else {
			return result;
		};

		let mut stack = vec![key];
		while let Some(current) = stack.pop() {
			let entry = &self.entries[current];
			result.push((current, &entry.value));
			stack.extend(entry.children.iter().rev());
		}
		result
	}

	/// Removes `path` and everything beneath it, returning the removed entries.
	pub fn erase_subtree(&mut self, path: &sdf::Path) -> Vec<(sdf::Path, V)> {
		let mut removed = Vec::new();
		let Some(entry) = self.entries.remove(path) else {
			return removed;
		};

		let parent = path.parent_path();
		if let Some(parent) = self.entries.get_mut(&parent) {
			parent.children.retain(|child| child != path);
		}

		let mut stack = entry.children;
		removed.push((path.clone(), entry.value));
		while let Some(current) = stack.pop() {
			if let Some(entry) = self.entries.remove(&current) {
				stack.extend(entry.children);
				removed.push((current, entry.value));
			}
		}
		removed
	}

	/// Removes `path` if it has no children and `is_unused` holds for its
	/// value, then does the same for each ancestor in turn.
	///
	/// Returns how many entries were removed.
	pub fn prune(&mut self, path: &sdf::Path, is_unused: impl Fn(&V) -> bool) -> usize {
		let mut removed = 0;
		let mut current = path.clone();
		while !current.is_empty() {
			let Some(entry) = self.entries.get(&current) else {
				break;
			};
			if !entry.children.is_empty() || !is_unused(&entry.value) {
				break;
			}
			self.entries.remove(&current);
			removed += 1;

			let parent = current.parent_path();
			if let Some(entry) = self.entries.get_mut(&parent) {
				entry.children.retain(|child| *child != current);
			}
			current = parent;
		}
		removed
	}

	/// Removes every entry, returning the values.
	pub fn drain_all(&mut self) -> Vec<(sdf::Path, V)> {
		self.entries
			.drain()
			.map(|(path, entry)| (path, entry.value))
			.collect()
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}
}

impl<V: Default> PathTable<V> {
	/// Inserts `value` at `path` unless an entry exists already.
	///
	/// Returns the entry's value and whether it was inserted.
	pub fn insert(&mut self, path: sdf::Path, value: V) -> (&mut V, bool) {
		if !self.entries.contains_key(&path) {
			self.link_to_parent(&path);
		}
		match self.entries.entry(path) {
			hash_map::Entry::Occupied(entry) => (&mut entry.into_mut().value, false),
			hash_map::Entry::Vacant(entry) => {
				let entry = entry.insert(Entry {
					value,
					children: Vec::new(),
				});
				(&mut entry.value, true)
			}
		}
	}

	pub fn entry_or_default(&mut self, path: sdf::Path) -> &mut V {
		self.insert(path, V::default()).0
	}

	fn link_to_parent(&mut self, path: &sdf::Path) {
		if path.is_absolute_root() || path.is_empty() {
			return;
		}

		let parent = path.parent_path();
		if parent.is_empty() {
			return;
		}
		if !self.entries.contains_key(&parent) {
			self.link_to_parent(&parent);
			self.entries.insert(
				parent.clone(),
				Entry {
					value: V::default(),
					children: Vec::new(),
				},
			);
		}
		if let Some(entry) = self.entries.get_mut(&parent) {
			entry.children.push(path.clone());
		}
	}
}

impl<V: Send> PathTable<V> {
	/// Drops every value, spreading the work over the rayon pool.
	pub fn clear_in_parallel(self) {
		self.entries
			.into_par_iter()
			.for_each(|(_, entry)| drop(entry));
	}
}
