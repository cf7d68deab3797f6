//! Snapshot round-trips, mapped views and compatibility checks.

use proxima_index::{Error, Index, IndexOptions, Metric, MetricKind, ScalarKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const DIMS: usize = 8;

fn options(metric: MetricKind) -> IndexOptions {
    let mut options = IndexOptions::new(DIMS);
    options.metric = metric;
    options.capacity = 1024;
    options.max_workers = 1;
    options
}

fn build_random(count: usize, seed: u64) -> (Index, Vec<Vec<f32>>) {
    let index = Index::new(options(MetricKind::L2sq)).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vectors = Vec::with_capacity(count);
    for label in 0..count {
        let vector: Vec<f32> = (0..DIMS).map(|_| rng.gen_range(-1.0..1.0)).collect();
        index.add(label as i64, &vector, 0).unwrap();
        vectors.push(vector);
    }
    (index, vectors)
}

fn assert_same_topology(a: &Index, b: &Index) {
    assert_eq!(a.size(), b.size());
    assert_eq!(a.connectivity(), b.connectivity());
    for id in 0..a.size() as u32 {
        assert_eq!(a.label_of(id).unwrap(), b.label_of(id).unwrap(), "label of {id}");
        assert_eq!(
            a.vector_bytes(id).unwrap(),
            b.vector_bytes(id).unwrap(),
            "vector bytes of {id}"
        );
        let top = a.top_layer(id).unwrap();
        assert_eq!(top, b.top_layer(id).unwrap(), "top layer of {id}");
        for layer in 0..=top {
            assert_eq!(
                a.neighbors(id, layer).unwrap(),
                b.neighbors(id, layer).unwrap(),
                "neighbor list of {id} at layer {layer}"
            );
        }
    }
}

fn assert_same_answers(a: &Index, b: &Index, queries: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut labels_a = [0i64; 10];
    let mut labels_b = [0i64; 10];
    let mut distances_a = [0f32; 10];
    let mut distances_b = [0f32; 10];
    for _ in 0..queries {
        let query: Vec<f32> = (0..DIMS).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let found_a = a.search(&query, 10, 0, &mut labels_a, &mut distances_a).unwrap();
        let found_b = b.search(&query, 10, 0, &mut labels_b, &mut distances_b).unwrap();
        assert_eq!(found_a, found_b);
        assert_eq!(labels_a[..found_a], labels_b[..found_b]);
        assert_eq!(distances_a[..found_a], distances_b[..found_b]);
    }
}

#[test]
fn save_load_roundtrip_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.prx");

    let (index, _) = build_random(300, 11);
    index.save(&path).unwrap();

    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    fresh.load(&path).unwrap();

    assert_same_topology(&index, &fresh);
    assert_same_answers(&index, &fresh, 100, 12);
}

#[test]
fn loaded_index_stays_mutable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.prx");

    let (index, _) = build_random(50, 13);
    index.save(&path).unwrap();

    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    fresh.load(&path).unwrap();
    let id = fresh.add(999, &[0.5; DIMS], 0).unwrap();
    assert_eq!(id, 50);
    assert_eq!(fresh.size(), 51);

    let mut labels = [0i64; 1];
    let mut distances = [0f32; 1];
    let found = fresh.search(&[0.5; DIMS], 1, 0, &mut labels, &mut distances).unwrap();
    assert_eq!(found, 1);
    assert_eq!(labels[0], 999);
}

#[test]
fn view_serves_identical_answers_readonly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.prx");

    let (index, _) = build_random(300, 21);
    index.save(&path).unwrap();

    let loaded = Index::new(options(MetricKind::L2sq)).unwrap();
    loaded.load(&path).unwrap();

    let viewed = Index::new(options(MetricKind::L2sq)).unwrap();
    viewed.view(&path).unwrap();

    assert_same_topology(&loaded, &viewed);
    assert_same_answers(&loaded, &viewed, 100, 22);

    assert!(matches!(viewed.add(1, &[0.0; DIMS], 0), Err(Error::Immutable)));
    assert!(matches!(viewed.reserve(4096), Err(Error::Immutable)));
    assert!(matches!(viewed.clear(), Err(Error::Immutable)));
}

#[test]
fn view_can_be_resaved() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.prx");
    let second = dir.path().join("b.prx");

    let (index, _) = build_random(80, 31);
    index.save(&first).unwrap();

    let viewed = Index::new(options(MetricKind::L2sq)).unwrap();
    viewed.view(&first).unwrap();
    viewed.save(&second).unwrap();

    let reloaded = Index::new(options(MetricKind::L2sq)).unwrap();
    reloaded.load(&second).unwrap();
    assert_same_topology(&index, &reloaded);
}

#[test]
fn empty_index_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.prx");

    let index = Index::new(options(MetricKind::L2sq)).unwrap();
    index.save(&path).unwrap();

    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    fresh.load(&path).unwrap();
    assert_eq!(fresh.size(), 0);

    let viewed = Index::new(options(MetricKind::L2sq)).unwrap();
    viewed.view(&path).unwrap();
    let mut labels = [0i64; 1];
    let mut distances = [0f32; 1];
    assert_eq!(viewed.search(&[0.0; DIMS], 1, 0, &mut labels, &mut distances).unwrap(), 0);
}

#[test]
fn geometry_and_metric_mismatches_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.prx");
    let (index, _) = build_random(20, 41);
    index.save(&path).unwrap();

    let mut wrong_dims = options(MetricKind::L2sq);
    wrong_dims.dimensions = DIMS + 1;
    let fresh = Index::new(wrong_dims).unwrap();
    assert!(matches!(fresh.load(&path), Err(Error::IncompatibleFile(_))));

    let fresh = Index::new(options(MetricKind::Cos)).unwrap();
    assert!(matches!(fresh.load(&path), Err(Error::IncompatibleFile(_))));

    let mut wrong_scalar = options(MetricKind::L2sq);
    wrong_scalar.scalar = ScalarKind::F16;
    let fresh = Index::new(wrong_scalar).unwrap();
    assert!(matches!(fresh.load(&path), Err(Error::IncompatibleFile(_))));
    assert!(matches!(fresh.view(&path), Err(Error::IncompatibleFile(_))));
}

#[test]
fn garbage_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.prx");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    match fresh.load(&path) {
        Err(Error::IncompatibleFile(_) | Error::Io(_)) => {}
        other => panic!("expected a load failure, got {other:?}"),
    }
}

#[test]
fn truncated_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.prx");
    let truncated = dir.path().join("truncated.prx");

    let (index, _) = build_random(100, 51);
    index.save(&path).unwrap();
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    match fresh.load(&truncated) {
        Err(Error::IncompatibleFile(_) | Error::Io(_)) => {}
        other => panic!("expected a load failure, got {other:?}"),
    }
    let fresh = Index::new(options(MetricKind::L2sq)).unwrap();
    match fresh.view(&truncated) {
        Err(Error::IncompatibleFile(_) | Error::Io(_)) => {}
        other => panic!("expected a view failure, got {other:?}"),
    }
}

#[test]
fn word_payload_indexes_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hashes.prx");

    let mut opts = IndexOptions::new(4);
    opts.metric = MetricKind::Hamming;
    opts.scalar = ScalarKind::U64;
    opts.capacity = 64;
    opts.max_workers = 1;
    let index = Index::new(opts.clone()).unwrap();

    let mut rng = StdRng::seed_from_u64(61);
    for label in 0..40i64 {
        let words: Vec<u64> = (0..4).map(|_| rng.gen()).collect();
        index.add_words(label, &words, 0).unwrap();
    }
    index.save(&path).unwrap();

    let fresh = Index::new(opts).unwrap();
    fresh.load(&path).unwrap();
    assert_same_topology(&index, &fresh);

    let query: Vec<u64> = (0..4).map(|_| rng.gen()).collect();
    let mut labels_a = [0i64; 5];
    let mut labels_b = [0i64; 5];
    let mut distances_a = [0f32; 5];
    let mut distances_b = [0f32; 5];
    let found_a = index.search_words(&query, 5, 0, &mut labels_a, &mut distances_a).unwrap();
    let found_b = fresh.search_words(&query, 5, 0, &mut labels_b, &mut distances_b).unwrap();
    assert_eq!(found_a, found_b);
    assert_eq!(labels_a[..found_a], labels_b[..found_b]);
}

#[test]
fn user_metric_files_only_reload_with_a_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.prx");

    let callback: proxima_index::Metric = Metric::User(Arc::new(|a: &[u8], b: &[u8], _dims| {
        a.iter().zip(b).map(|(&x, &y)| (f32::from(x) - f32::from(y)).abs()).sum()
    }));

    let mut opts = options(MetricKind::L2sq);
    opts.max_workers = 1;
    let index = Index::with_metric(opts.clone(), callback.clone()).unwrap();
    index.add(1, &[0.25; DIMS], 0).unwrap();
    index.add(2, &[0.75; DIMS], 0).unwrap();
    index.save(&path).unwrap();

    // Built-in metrics refuse the non-portable file.
    let builtin = Index::new(options(MetricKind::L2sq)).unwrap();
    assert!(matches!(builtin.load(&path), Err(Error::IncompatibleFile(_))));

    // Another user-metric index accepts it.
    let fresh = Index::with_metric(opts, callback).unwrap();
    fresh.load(&path).unwrap();
    assert_eq!(fresh.size(), 2);
    assert_eq!(fresh.label_of(0).unwrap(), 1);
}
