use super::builder::IndexBuilder;
use super::dependencies::{ConcurrentPopulationContext, CulledDependency, DynamicFileFormatDependencyData};
use super::diagnostic::verify;
use super::error::Error;
use super::layer_stack::LayerStack;
use super::path_table::PathTable;
use super::prim_index::{PayloadSet, PayloadState, PrimIndex, PrimIndexInputs};
use crate::{sdf, tf};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which children of a prim the parallel indexer descends into once the
/// prim's index is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildSelection {
	None,
	All,
	/// Only the named children, if the prim has them.
	Only(Vec<tf::Token>),
}

impl ChildSelection {
	fn includes(&self, name: &tf::Token) -> bool {
		match self {
			ChildSelection::None => false,
			ChildSelection::All => true,
			ChildSelection::Only(names) => names.contains(name),
		}
	}
}

/// Records a payload decision made by a predicate in the include set.
pub(crate) fn update_payload_set(payloads: &RwLock<PayloadSet>, path: &sdf::Path, state: PayloadState) {
	match state {
		PayloadState::IncludedByPredicate => {
			payloads.write().insert(path.clone());
		}
		PayloadState::ExcludedByPredicate => {
			payloads.write().remove(path);
		}
		_ => {}
	}
}

struct Output {
	path: sdf::Path,
	prim_index: Arc<PrimIndex>,
	culled_dependencies: Vec<CulledDependency>,
	dynamic_file_format_dependency: DynamicFileFormatDependencyData,
}

/// Computes a batch of prim indices on the rayon pool.
///
/// A child is only indexed once its parent index is available, and the
/// parent is handed to the child task as a shared handle. Finished indices
/// go through a queue that a single worker at a time drains into the cache.
pub(crate) struct ParallelIndexer<'a> {
	prim_indexes: &'a RwLock<PathTable<Arc<PrimIndex>>>,
	dependencies: ConcurrentPopulationContext<'a>,
	builder: &'a dyn IndexBuilder,
	layer_stack: &'a Arc<LayerStack>,
	inputs: PrimIndexInputs<'a>,
	children_predicate: &'a (dyn Fn(&PrimIndex) -> ChildSelection + Sync),
	errors: Mutex<Vec<Error>>,
	to_publish: Mutex<VecDeque<Output>>,
	is_publishing: AtomicBool,
}

impl<'a> ParallelIndexer<'a> {
	pub fn new(
		prim_indexes: &'a RwLock<PathTable<Arc<PrimIndex>>>,
		dependencies: ConcurrentPopulationContext<'a>,
		builder: &'a dyn IndexBuilder,
		layer_stack: &'a Arc<LayerStack>,
		inputs: PrimIndexInputs<'a>,
		children_predicate: &'a (dyn Fn(&PrimIndex) -> ChildSelection + Sync),
	) -> Self {
		Self {
			prim_indexes,
			dependencies,
			builder,
			layer_stack,
			inputs,
			children_predicate,
			errors: Mutex::default(),
			to_publish: Mutex::default(),
			is_publishing: AtomicBool::new(false),
		}
	}

	/// Indexes every `(parent, root)` pair and the descendants the children
	/// predicate asks for. Returns the composition errors of the batch.
	pub fn run(self, roots: Vec<(Option<Arc<PrimIndex>>, sdf::Path)>) -> Vec<Error> {
		tracing::debug!(roots = roots.len(), "indexing in parallel");

		rayon::scope(|scope| {
			for (parent, path) in roots {
				let this = &self;
				scope.spawn(move |scope| this.compute_index(scope, parent, path, true));
			}
		});

		// Workers that lost the publishing race may have left outputs behind.
		self.publish_outputs();

		tracing::debug!("parallel indexing done");
		self.errors.into_inner()
	}

	fn compute_index<'s>(
		&'s self,
		scope: &rayon::Scope<'s>,
		parent: Option<Arc<PrimIndex>>,
		path: sdf::Path,
		mut check_cache: bool,
	) {
		verify!(
			parent.is_some() || path.is_absolute_root(),
			"indexing <{}> without its parent index",
			path
		);

		let mut index = None;
		if check_cache {
			let prim_indexes = self.prim_indexes.read();
			match prim_indexes.get(&path) {
				// Nothing is cached here or below.
				None => check_cache = false,
				Some(cached) if cached.is_valid() => index = Some(cached.clone()),
				// An invalid placeholder. Descendants may still be cached.
				Some(_) => {}
			}
		}

		let index = match index {
			Some(index) => index,
			None => {
				let inputs = PrimIndexInputs {
					parent_index: parent.as_deref(),
					..self.inputs
				};
				let outputs = self.builder.compute_prim_index(&path, self.layer_stack, &inputs);

				if !outputs.all_errors.is_empty() {
					self.errors.lock().extend(outputs.all_errors);
				}
				update_payload_set(self.inputs.included_payloads, &path, outputs.payload_state);

				let output = Output {
					path: path.clone(),
					prim_index: Arc::new(outputs.prim_index),
					culled_dependencies: outputs.culled_dependencies,
					dynamic_file_format_dependency: outputs.dynamic_file_format_dependency,
				};

				if check_cache {
					// Replaces the invalid placeholder right away so that the
					// entries below it stay reachable.
					self.publish_one(output)
				} else {
					let prim_index = output.prim_index.clone();
					self.to_publish.lock().push_back(output);
					if self
						.is_publishing
						.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
						.is_ok()
					{
						self.publish_outputs();
						self.is_publishing.store(false, Ordering::Release);
					}
					prim_index
				}
			}
		};

		let selection = (self.children_predicate)(&index);
		if selection == ChildSelection::None {
			return;
		}

		let (names, _) = index.compute_prim_child_names();
		for name in names.into_iter().filter(|name| selection.includes(name)) {
			let parent = index.clone();
			let child_path = path.append_child(&name);
			scope.spawn(move |scope| self.compute_index(scope, Some(parent), child_path, check_cache));
		}
	}

	/// Stores `output` in the cache unless a valid index got there first.
	///
	/// Returns the index that ends up in the cache.
	fn publish_one(&self, output: Output) -> Arc<PrimIndex> {
		let Output {
			path,
			prim_index,
			culled_dependencies,
			dynamic_file_format_dependency,
		} = output;

		{
			let mut prim_indexes = self.prim_indexes.write();
			let entry = prim_indexes.entry_or_default(path.clone());
			if entry.is_valid() {
				// Overlapping roots computed the same prim twice.
				tracing::trace!(path = %path, "dropping duplicate prim index");
				return entry.clone();
			}
			*entry = prim_index.clone();
		}

		if prim_index.is_valid() {
			self.dependencies
				.add(&prim_index, culled_dependencies, dynamic_file_format_dependency);
		}
		tracing::trace!(path = %path, "published prim index");
		prim_index
	}

	fn publish_outputs(&self) {
		loop {
			let output = self.to_publish.lock().pop_front();
			let Some(output) = output else {
				break;
			};
			self.publish_one(output);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ar;
	use crate::pcp::builder::LayerIndexBuilder;
	use crate::pcp::dependencies::Dependencies;
	use crate::pcp::layer_stack::LayerStackIdentifier;
	use crate::pcp::lifeboat::Lifeboat;
	use crate::pcp::prim_index::VariantFallbackMap;
	use crate::pcp::registry::LayerStackRegistry;

	#[test]
	fn first_published_index_wins() {
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		let model = resolver.create_layer("model.usda");
		model.define_prim(&"/B".into(), sdf::Specifier::Def);
		root.define_prim(&"/A".into(), sdf::Specifier::Def);
		root.add_reference(&"/A".into(), sdf::Reference::new("model.usda", "/B"));

		let registry = LayerStackRegistry::new();
		let id = LayerStackIdentifier::new(root)
			.with_resolver_context(ar::ResolverContext::new(resolver.clone()));
		let (layer_stack, _) = registry.find_or_create(&id);
		let fallbacks = VariantFallbackMap::new();
		let payloads = RwLock::default();
		let inputs = PrimIndexInputs {
			registry: &registry,
			parent_index: None,
			variant_fallbacks: &fallbacks,
			included_payloads: &payloads,
			include_payload_predicate: None,
			cull: true,
			usd: true,
		};

		let path = sdf::Path::from("/A");
		let output = || {
			let outputs = LayerIndexBuilder.compute_prim_index(&path, &layer_stack, &inputs);
			Output {
				path: path.clone(),
				prim_index: Arc::new(outputs.prim_index),
				culled_dependencies: outputs.culled_dependencies,
				dynamic_file_format_dependency: outputs.dynamic_file_format_dependency,
			}
		};
		let first = output();
		let second = output();
		let first_index = first.prim_index.clone();
		let second_index = second.prim_index.clone();

		let prim_indexes = RwLock::new(PathTable::new());
		let mut dependencies = Dependencies::new();
		let children = |_: &PrimIndex| ChildSelection::None;
		{
			let indexer = ParallelIndexer::new(
				&prim_indexes,
				dependencies.concurrent_population(),
				&LayerIndexBuilder,
				&layer_stack,
				inputs,
				&children,
			);
			assert!(Arc::ptr_eq(&indexer.publish_one(first), &first_index));
			assert!(Arc::ptr_eq(&indexer.publish_one(second), &first_index));
		}

		let cached = prim_indexes.read().get(&path).cloned().unwrap();
		assert!(Arc::ptr_eq(&cached, &first_index));
		assert!(!Arc::ptr_eq(&cached, &second_index));

		// The duplicate recorded no dependencies of its own.
		assert_eq!(dependencies.used_layer_stacks().len(), 1);
		let mut lifeboat = Lifeboat::new();
		dependencies.remove(&cached, &mut lifeboat);
		assert!(dependencies.used_layer_stacks().is_empty());
		assert_eq!(lifeboat.layer_stacks().len(), 1);
	}
}
