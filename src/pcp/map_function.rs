use crate::sdf;

/// Maps paths from the namespace of a composition node to the namespace of
/// another node, along with the time offset between them.
///
/// A function is a set of `(source, target)` path pairs. A path maps through
/// the pair whose source is its longest prefix, unless the mapped result falls
/// under a target owned by a more specific pair, in which case it is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapFunction {
	pairs: Vec<(sdf::Path, sdf::Path)>,
	offset: sdf::Retiming,
}

impl Default for MapFunction {
	fn default() -> Self {
		Self::identity()
	}
}

impl MapFunction {
	pub fn identity() -> Self {
		Self {
			pairs: vec![(
				sdf::Path::absolute_root_path(),
				sdf::Path::absolute_root_path(),
			)],
			offset: sdf::Retiming::IDENTITY,
		}
	}

	/// A function that maps nothing.
	pub fn null() -> Self {
		Self {
			pairs: Vec::new(),
			offset: sdf::Retiming::IDENTITY,
		}
	}

	pub fn new(pairs: impl IntoIterator<Item = (sdf::Path, sdf::Path)>, offset: sdf::Retiming) -> Self {
		let mut function = Self {
			pairs: pairs
				.into_iter()
				.filter(|(source, target)| !source.is_empty() && !target.is_empty())
				.collect(),
			offset,
		};
		function.canonicalize();
		function
	}

	pub fn is_identity(&self) -> bool {
		self.has_root_identity() && self.pairs.len() == 1 && self.offset.is_identity()
	}

	pub fn is_null(&self) -> bool {
		self.pairs.is_empty()
	}

	/// Returns whether `/` maps to `/`.
	pub fn has_root_identity(&self) -> bool {
		self.pairs
			.iter()
			.any(|(source, target)| source.is_absolute_root() && target.is_absolute_root())
	}

	pub fn offset(&self) -> sdf::Retiming {
		self.offset
	}

	pub fn pairs(&self) -> &[(sdf::Path, sdf::Path)] {
		&self.pairs
	}

	pub fn map_source_to_target(&self, path: &sdf::Path) -> Option<sdf::Path> {
		map_path(&self.pairs, path, false)
	}

	pub fn map_target_to_source(&self, path: &sdf::Path) -> Option<sdf::Path> {
		map_path(&self.pairs, path, true)
	}

	/// Returns `self ∘ inner`: paths are mapped through `inner` first.
	pub fn compose(&self, inner: &MapFunction) -> MapFunction {
		if self.is_identity() {
			return inner.clone();
		}
		if inner.is_identity() {
			return self.clone();
		}

		let mut pairs = Vec::new();

		for (source, target) in &inner.pairs {
			if let Some(mapped) = self.map_source_to_target(target) {
				pairs.push((source.clone(), mapped));
			}
		}

		for (source, target) in &self.pairs {
			if let Some(unmapped) = inner.map_target_to_source(source)
				&& !pairs.iter().any(|(s, _)| *s == unmapped)
			{
				pairs.push((unmapped, target.clone()));
			}
		}

		Self::new(pairs, self.offset * inner.offset)
	}

	pub fn compose_offset(&self, offset: sdf::Retiming) -> MapFunction {
		Self {
			pairs: self.pairs.clone(),
			offset: self.offset * offset,
		}
	}

	// Drops pairs implied by a less specific pair and sorts the rest.
	fn canonicalize(&mut self) {
		self.pairs.sort();
		self.pairs.dedup_by(|a, b| a.0 == b.0);

		let mut kept: Vec<(sdf::Path, sdf::Path)> = Vec::with_capacity(self.pairs.len());
		for (source, target) in std::mem::take(&mut self.pairs) {
			let implied = !source.is_absolute_root()
				&& map_path(&kept, &source, false).is_some_and(|mapped| mapped == target);
			if !implied {
				kept.push((source, target));
			}
		}
		self.pairs = kept;
	}
}

fn map_path(pairs: &[(sdf::Path, sdf::Path)], path: &sdf::Path, invert: bool) -> Option<sdf::Path> {
	if path.is_empty() {
		return None;
	}

	let side = |pair: &(sdf::Path, sdf::Path)| -> (sdf::Path, sdf::Path) {
		if invert {
			(pair.1.clone(), pair.0.clone())
		} else {
			(pair.0.clone(), pair.1.clone())
		}
	};

	let (from, to) = pairs
		.iter()
		.map(side)
		.filter(|(from, _)| path.has_prefix(from))
		.max_by_key(|(from, _)| from.element_count())?;

	let mapped = path.replace_prefix(&from, &to);
	if mapped.is_empty() {
		return None;
	}

	// A more specific pair owns everything beneath its destination.
	let blocked = pairs
		.iter()
		.map(side)
		.any(|(_, other_to)| {
			other_to.element_count() > to.element_count() && mapped.has_prefix(&other_to)
		});

	(!blocked).then_some(mapped)
}

impl std::fmt::Display for MapFunction {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{{")?;
		for (i, (source, target)) in self.pairs.iter().enumerate() {
			if i > 0 {
				write!(f, ", ")?;
			}
			write!(f, "{source} -> {target}")?;
		}
		if !self.offset.is_identity() {
			write!(f, " (offset {}, scale {})", self.offset.offset, self.offset.scale)?;
		}
		write!(f, "}}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn reference(source: &str, target: &str) -> MapFunction {
		MapFunction::new([(p(source), p(target))], sdf::Retiming::IDENTITY)
	}

	#[test]
	fn maps_through_longest_prefix() {
		let f = reference("/B", "/A");
		assert_eq!(f.map_source_to_target(&p("/B/c.x")), Some(p("/A/c.x")));
		assert_eq!(f.map_target_to_source(&p("/A/c")), Some(p("/B/c")));
		assert_eq!(f.map_source_to_target(&p("/Other")), None);
		assert!(MapFunction::identity().is_identity());
		assert!(!f.has_root_identity());
	}

	#[test]
	fn class_arcs_block_the_root_identity() {
		let f = MapFunction::new(
			[(p("/Class"), p("/A")), (sdf::Path::absolute_root_path(), sdf::Path::absolute_root_path())],
			sdf::Retiming::IDENTITY,
		);
		assert_eq!(f.map_source_to_target(&p("/Class/x")), Some(p("/A/x")));
		assert_eq!(f.map_source_to_target(&p("/Other")), Some(p("/Other")));
		// /A is owned by the /Class pair.
		assert_eq!(f.map_source_to_target(&p("/A/x")), None);
	}

	#[test]
	fn compose_chains_arcs() {
		// /A references /B, which references /C.
		let a_to_b = reference("/B", "/A");
		let b_to_c = reference("/C", "/B");
		let composed = a_to_b.compose(&b_to_c);
		assert_eq!(composed.map_source_to_target(&p("/C/x")), Some(p("/A/x")));
		assert_eq!(composed, reference("/C", "/A"));

		assert_eq!(MapFunction::identity().compose(&a_to_b), a_to_b);
	}

	#[test]
	fn compose_offsets() {
		let f = MapFunction::identity().compose_offset(sdf::Retiming::new(10.0, 1.0));
		let g = f.compose(&MapFunction::identity().compose_offset(sdf::Retiming::new(5.0, 1.0)));
		assert_eq!(g.offset(), sdf::Retiming::new(15.0, 1.0));
		assert!(!g.is_identity());
	}
}
