#![allow(dead_code)]

use openusd_pcp::pcp::{self, Cache, CacheConfig, IndexBuilder, LayerIndexBuilder, LayerStackIdentifier};
use openusd_pcp::{ar, sdf};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn p(s: &str) -> sdf::Path {
	sdf::Path::from(s)
}

pub struct Scene {
	pub resolver: Arc<ar::MemoryResolver>,
	pub root: Arc<sdf::Layer>,
}

impl Scene {
	pub fn new() -> Self {
		init_tracing();
		let resolver = ar::MemoryResolver::new();
		let root = resolver.create_layer("root.usda");
		Self { resolver, root }
	}

	pub fn layer(&self, identifier: &str) -> Arc<sdf::Layer> {
		self.resolver.create_layer(identifier)
	}

	pub fn def(&self, layer: &sdf::Layer, paths: &[&str]) {
		for path in paths {
			layer.define_prim(&p(path), sdf::Specifier::Def);
		}
	}

	pub fn identifier(&self) -> LayerStackIdentifier {
		LayerStackIdentifier::new(self.root.clone())
			.with_resolver_context(ar::ResolverContext::new(self.resolver.clone()))
	}

	pub fn cache(&self) -> Cache {
		Cache::new(self.identifier(), CacheConfig::default())
	}

	pub fn usd_cache(&self) -> Cache {
		Cache::new(self.identifier(), CacheConfig::usd())
	}

	pub fn cache_with_builder(&self, config: CacheConfig, builder: Arc<dyn IndexBuilder>) -> Cache {
		Cache::with_builder(self.identifier(), config, pcp::LayerStackRegistry::new(), builder)
	}
}

/// Forwards to [`LayerIndexBuilder`] and records every path it builds.
#[derive(Default)]
pub struct RecordingBuilder {
	pub built: Mutex<Vec<sdf::Path>>,
	pub calls: AtomicUsize,
}

impl RecordingBuilder {
	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn built(&self) -> Vec<sdf::Path> {
		self.built.lock().clone()
	}
}

impl IndexBuilder for RecordingBuilder {
	fn compute_prim_index(
		&self,
		path: &sdf::Path,
		layer_stack: &Arc<pcp::LayerStack>,
		inputs: &pcp::PrimIndexInputs,
	) -> pcp::PrimIndexOutputs {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if let Some(parent) = inputs.parent_index {
			assert_eq!(*parent.path(), path.parent_path(), "wrong parent handed to <{path}>");
		}
		self.built.lock().push(path.clone());
		LayerIndexBuilder.compute_prim_index(path, layer_stack, inputs)
	}
}
