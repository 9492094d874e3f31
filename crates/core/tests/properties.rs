use proptest::prelude::*;
use quantum_core::storage::MemoryRegion;
use quantum_core::{
    DistanceMetric, HnswIndex, IndexOptions, NeighborSelection, RowId, SearchOptions,
};

fn metric_strategy() -> impl Strategy<Value = DistanceMetric> {
    prop_oneof![
        Just(DistanceMetric::L2),
        Just(DistanceMetric::InnerProduct),
        Just(DistanceMetric::Cosine),
    ]
}

fn selection_strategy() -> impl Strategy<Value = NeighborSelection> {
    prop_oneof![Just(NeighborSelection::Heuristic), Just(NeighborSelection::Nearest)]
}

fn points_strategy(dims: usize, max: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    proptest::collection::vec(proptest::collection::vec(-10.0f32..10.0, dims), 1..=max)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Degree caps, symmetry and monotone presence hold after any insert/delete sequence.
    #[test]
    fn prop_invariants_hold(
        m in 1usize..=6,
        metric in metric_strategy(),
        selection in selection_strategy(),
        points in points_strategy(3, 120),
        deletes in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
        seed in any::<u64>(),
    ) {
        let opts = IndexOptions::new(3)
            .with_m(m)
            .with_ef_build(m * 2)
            .with_metric(metric)
            .with_selection(selection)
            .with_seed(seed);
        let index = HnswIndex::new(opts).unwrap();
        for (i, p) in points.iter().enumerate() {
            index.insert(RowId(i as u64), p).unwrap();
        }
        let mut deleted = std::collections::HashSet::new();
        for d in &deletes {
            let row = d.index(points.len()) as u64;
            if index.mark_deleted(RowId(row)) {
                deleted.insert(row);
            }
        }
        prop_assert_eq!(index.node_count(), points.len());
        prop_assert_eq!(index.len(), points.len() - deleted.len());
        if let Err(e) = index.validate() {
            return Err(TestCaseError::fail(e));
        }
        for id in 0..points.len() as u32 {
            let top = index.graph().top_layer(id).unwrap();
            prop_assert!(index.graph().neighbors(id, 0).unwrap().len() <= 2 * m);
            for layer in 1..=top {
                prop_assert!(index.graph().neighbors(id, layer).unwrap().len() <= m);
            }
        }
        if !index.is_empty() {
            for hit in index.search(&points[0], 10).unwrap() {
                prop_assert!(!deleted.contains(&hit.row_id.0));
            }
        }
    }

    /// On a graph small enough to be complete at layer 0, an inserted vector is
    /// always its own nearest neighbor, even with the smallest candidate list.
    #[test]
    fn prop_exact_match_small_graph(
        points in points_strategy(4, 33),
        probe in any::<prop::sample::Index>(),
        ef in 1usize..=8,
    ) {
        let index = HnswIndex::new(IndexOptions::new(4).with_m(16).with_ef_build(64)).unwrap();
        for (i, p) in points.iter().enumerate() {
            index.insert(RowId(i as u64), p).unwrap();
        }
        let q = &points[probe.index(points.len())];
        let hit = index.search_with(q, &SearchOptions::new(1).with_ef(ef)).unwrap();
        prop_assert_eq!(hit[0].distance, 0.0);
        prop_assert_eq!(&points[hit[0].row_id.0 as usize], q);
    }

    /// Results come back sorted by distance, then by internal id.
    #[test]
    fn prop_results_sorted(
        points in points_strategy(2, 80),
        q in proptest::collection::vec(-10.0f32..10.0, 2),
        k in 1usize..=20,
    ) {
        let index = HnswIndex::new(IndexOptions::new(2).with_m(4).with_ef_build(16)).unwrap();
        for (i, p) in points.iter().enumerate() {
            index.insert(RowId(i as u64), p).unwrap();
        }
        let hits = index.search(&q, k).unwrap();
        prop_assert!(hits.len() <= k);
        for w in hits.windows(2) {
            prop_assert!((w[0].distance, w[0].node) < (w[1].distance, w[1].node));
        }
    }

    /// Flushing and loading reproduces the same search results.
    #[test]
    fn prop_flush_load_equivalent(
        points in points_strategy(3, 60),
        q in proptest::collection::vec(-10.0f32..10.0, 3),
    ) {
        let index = HnswIndex::new(IndexOptions::new(3).with_m(3).with_ef_build(9)).unwrap();
        for (i, p) in points.iter().enumerate() {
            index.insert(RowId(i as u64), p).unwrap();
        }
        let mut region = MemoryRegion::new();
        index.flush_to(&mut region).unwrap();
        let loaded = HnswIndex::load_from(&region).unwrap();
        prop_assert_eq!(loaded.search(&q, 5).unwrap(), index.search(&q, 5).unwrap());
    }
}
