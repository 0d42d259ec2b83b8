mod common;

use common::{RecordingBuilder, Scene, p};
use openusd_pcp::pcp::{ArcType, Cache, CacheConfig, ChildSelection, PrimIndex};
use openusd_pcp::{sdf, tf};
use std::sync::Arc;

/// A small scene with nesting, a reference and a payload.
fn build_scene() -> Scene {
	let scene = Scene::new();
	let model = scene.layer("model.usda");
	scene.def(&model, &["/M", "/M/X", "/M/X/Y"]);
	let heavy = scene.layer("heavy.usda");
	scene.def(&heavy, &["/Heavy", "/Heavy/Part"]);

	scene.def(&scene.root, &["/A", "/A/B", "/A/B/D", "/A/C", "/E", "/P"]);
	scene.root.add_reference(&p("/E"), sdf::Reference::new("model.usda", "/M"));
	scene.root.add_payload(&p("/P"), sdf::Payload::new("heavy.usda", "/Heavy"));
	scene
}

const ALL_PRIMS: &[&str] = &["/", "/A", "/A/B", "/A/B/D", "/A/C", "/E", "/E/X", "/E/X/Y", "/P"];

fn describe(index: &PrimIndex) -> Vec<(ArcType, String, String)> {
	index
		.nodes()
		.map(|node| {
			(
				node.arc_type(),
				node.layer_stack().root_layer().identifier().to_string(),
				node.path().to_string(),
			)
		})
		.collect()
}

fn all_children(_: &PrimIndex) -> ChildSelection {
	ChildSelection::All
}

#[test]
fn parallel_results_match_serial_results() {
	let scene = build_scene();

	let mut serial = scene.usd_cache();
	let mut serial_errors = Vec::new();
	for path in ALL_PRIMS {
		serial.compute_prim_index(&p(path), &mut serial_errors);
	}

	let mut parallel = scene.usd_cache();
	let mut parallel_errors = Vec::new();
	parallel.compute_prim_indexes_in_parallel(&[p("/")], &mut parallel_errors, all_children, |_| false);

	assert_eq!(serial_errors, parallel_errors);
	for path in ALL_PRIMS {
		let serial = serial.find_prim_index(&p(path)).unwrap();
		let parallel = parallel
			.find_prim_index(&p(path))
			.unwrap_or_else(|| panic!("{path} was not indexed"));
		assert_eq!(describe(&serial), describe(&parallel), "{path}");
	}
	assert_eq!(
		serial.statistics().prim_indexes,
		parallel.statistics().prim_indexes
	);
}

#[test]
fn parents_are_indexed_before_children() {
	let scene = build_scene();
	let builder = Arc::new(RecordingBuilder::default());
	let mut cache = scene.cache_with_builder(CacheConfig::usd(), builder.clone());

	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), all_children, |_| false);

	let built = builder.built();
	assert_eq!(built.len(), ALL_PRIMS.len());
	for (i, path) in built.iter().enumerate() {
		if path.is_absolute_root() {
			continue;
		}
		let parent = path.parent_path();
		assert!(
			built[..i].contains(&parent),
			"{path} was built before its parent"
		);
	}
}

#[test]
fn cached_indices_are_reused() {
	let scene = build_scene();
	let builder = Arc::new(RecordingBuilder::default());
	let mut cache = scene.cache_with_builder(CacheConfig::usd(), builder.clone());

	let nested = cache.compute_prim_index(&p("/A/B"), &mut Vec::new());
	assert_eq!(builder.calls(), 1);

	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), all_children, |_| false);
	assert_eq!(builder.calls(), ALL_PRIMS.len());
	assert!(Arc::ptr_eq(&cache.find_prim_index(&p("/A/B")).unwrap(), &nested));

	// A second pass finds everything cached.
	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), all_children, |_| false);
	assert_eq!(builder.calls(), ALL_PRIMS.len());
}

#[test]
fn child_selection_limits_the_traversal() {
	let scene = build_scene();
	let mut cache = scene.usd_cache();

	let only_a = |index: &PrimIndex| {
		if index.path().is_absolute_root() {
			ChildSelection::Only(vec![tf::Token::new("A")])
		} else if *index.path() == p("/A") {
			ChildSelection::All
		} else {
			ChildSelection::None
		}
	};
	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), only_a, |_| false);

	assert!(cache.find_prim_index(&p("/A")).is_some());
	assert!(cache.find_prim_index(&p("/A/B")).is_some());
	assert!(cache.find_prim_index(&p("/A/C")).is_some());
	assert!(cache.find_prim_index(&p("/A/B/D")).is_none());
	assert!(cache.find_prim_index(&p("/E")).is_none());
}

#[test]
fn non_root_batches_index_their_parents_first() {
	let scene = build_scene();
	let mut cache = scene.usd_cache();

	cache.compute_prim_indexes_in_parallel(
		&[p("/A/B"), p("/E/X")],
		&mut Vec::new(),
		|_| ChildSelection::None,
		|_| false,
	);

	for path in ["/A", "/A/B", "/E", "/E/X"] {
		assert!(cache.find_prim_index(&p(path)).is_some(), "{path} missing");
	}
	assert!(cache.find_prim_index(&p("/A/B/D")).is_none());
}

#[test]
fn payload_predicate_decisions_are_recorded() {
	let scene = build_scene();
	let mut cache = scene.usd_cache();

	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), all_children, |path| {
		*path == p("/P")
	});

	assert!(cache.is_payload_included(&p("/P")));
	let index = cache.find_prim_index(&p("/P")).unwrap();
	assert_eq!(index.nodes().nth(1).unwrap().arc_type(), ArcType::Payload);
	assert!(cache.find_prim_index(&p("/P/Part")).is_some());
}

#[test]
fn requires_usd_mode() {
	let scene = build_scene();
	let mut cache: Cache = scene.cache();

	cache.compute_prim_indexes_in_parallel(&[p("/")], &mut Vec::new(), all_children, |_| false);
	assert_eq!(cache.statistics().prim_indexes, 0);
}
