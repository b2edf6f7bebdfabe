use maskfeat::ExtractError;
use maskfeat::config::IndexConfig;
use maskfeat::index::{Index, IndexKind, Metric};
use ndarray::{Array2, s};
use rand::prelude::*;
use rstest::*;
use serde_json::json;

fn index_config(kind: &str, metric: &str) -> IndexConfig {
    serde_json::from_value(json!({
        "index_type": kind,
        "dimension": 16,
        "metric": metric,
        "nlist": 8,
        "M": 4,
        "nbits": 8,
    }))
    .unwrap()
}

#[fixture]
fn data() -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(123);
    Array2::from_shape_simple_fn((200, 16), || rng.random_range(-1.0f32..1.0))
}

#[rstest]
#[case("Flat", IndexKind::Flat)]
#[case("IVFFlat", IndexKind::IvfFlat)]
#[case("IVFPQ", IndexKind::IvfPq)]
#[case("HNSW", IndexKind::Hnsw)]
fn exact_match_survives_reload(data: Array2<f32>, #[case] name: &str, #[case] kind: IndexKind) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.index");

    let mut index = Index::new(&index_config(name, "L2"), 42).unwrap();
    assert_eq!(index.kind(), kind);
    index.train(data.view()).unwrap();
    index.add(data.view()).unwrap();
    assert_eq!(index.ntotal(), 200);
    index.write_file(&path).unwrap();

    let loaded = Index::from_file(&path).unwrap();
    assert_eq!(loaded.kind(), kind);
    assert_eq!(loaded.metric(), Metric::L2);
    assert_eq!(loaded.dimension(), 16);
    assert_eq!(loaded.ntotal(), 200);

    let queries = data.slice(s![..20, ..]);
    let result = loaded.search(queries, 3).unwrap();
    for (row, neighbors) in result.iter().enumerate() {
        assert_eq!(neighbors[0].label, row as i64);
        assert!(neighbors[0].distance < 1e-4);
        assert!(neighbors.windows(2).all(|w| w[0].distance <= w[1].distance));
    }
    assert_eq!(result, index.search(queries, 3).unwrap());
}

#[rstest]
fn inner_product_prefers_larger(data: Array2<f32>) {
    let mut index = Index::new(&index_config("Flat", "IP"), 0).unwrap();
    index.add(data.view()).unwrap();

    let query = data.slice(s![..1, ..]);
    let result = index.search(query, 5).unwrap();
    assert!(result[0].windows(2).all(|w| w[0].distance >= w[1].distance));

    let best = data.outer_iter().map(|v| v.dot(&query.row(0))).fold(f32::MIN, f32::max);
    assert!((result[0][0].distance - best).abs() < 1e-5);
}

#[rstest]
#[case("Flat")]
#[case("IVFFlat")]
#[case("HNSW")]
fn dimension_mismatch_is_rejected(#[case] name: &str) {
    let mut index = Index::new(&index_config(name, "L2"), 0).unwrap();
    let wrong = Array2::<f32>::zeros((3, 8));
    let err = index.add(wrong.view()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::IndexDimensionMismatch { expected: 16, actual: 8 })
    ));
}

#[rstest]
#[case("Flat")]
#[case("IVFFlat")]
#[case("IVFPQ")]
#[case("HNSW")]
fn empty_index_reloads(#[case] name: &str) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.index");

    let index = Index::new(&index_config(name, "L2"), 0).unwrap();
    index.write_file(&path).unwrap();
    let loaded = Index::from_file(&path).unwrap();

    assert_eq!(loaded.ntotal(), 0);
    let result = loaded.search(Array2::zeros((2, 16)).view(), 4).unwrap();
    assert_eq!(result.len(), 2);
    assert!(result.iter().all(Vec::is_empty));
}

#[test]
fn reject_non_index_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bogus.index");
    std::fs::write(&path, b"not an index").unwrap();
    assert!(Index::from_file(&path).is_err());
}

#[test]
fn nprobe_covers_all_lists() {
    let mut rng = StdRng::seed_from_u64(9);
    let data = Array2::from_shape_simple_fn((100, 16), || rng.random_range(-1.0f32..1.0));
    let mut ivf = Index::new(&index_config("IVFFlat", "L2"), 1).unwrap();
    ivf.train(data.view()).unwrap();
    ivf.add(data.view()).unwrap();
    ivf.set_nprobe(8);

    let mut flat = Index::new(&index_config("Flat", "L2"), 1).unwrap();
    flat.add(data.view()).unwrap();

    let query = Array2::from_shape_simple_fn((3, 16), || rng.random_range(-1.0f32..1.0));
    let labels = |r: Vec<Vec<maskfeat::index::Neighbor>>| {
        r.into_iter().map(|n| n.into_iter().map(|n| n.label).collect::<Vec<_>>()).collect::<Vec<_>>()
    };
    assert_eq!(labels(ivf.search(query.view(), 5).unwrap()), labels(flat.search(query.view(), 5).unwrap()));
}
