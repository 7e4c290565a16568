//! Property-based tests for adjacency invariants.
//!
//! - Endpoint range is enforced at construction
//! - Edge order never changes degree structure
//! - Disjoint packing preserves per-graph node and edge counts

use nodeflow_core::{DisjointGraphs, EdgeIndex, Error};
use proptest::prelude::*;

/// Random graph: node count plus in-range `(row, col)` pairs.
fn arb_graph() -> impl Strategy<Value = (usize, Vec<(u32, u32)>)> {
    (1usize..12).prop_flat_map(|n| {
        let pair = (0..n as u32, 0..n as u32);
        (Just(n), prop::collection::vec(pair, 0..40))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn in_range_edges_are_accepted((n, pairs) in arb_graph()) {
        let edges = EdgeIndex::from_pairs(&pairs, n).unwrap();
        prop_assert_eq!(edges.num_edges(), pairs.len());
        prop_assert_eq!(edges.in_degrees().iter().sum::<usize>(), pairs.len());
    }

    #[test]
    fn out_of_range_endpoint_is_rejected((n, mut pairs) in arb_graph(), extra in 0u32..5) {
        pairs.push((0, n as u32 + extra));
        let err = EdgeIndex::from_pairs(&pairs, n).unwrap_err();
        prop_assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn reversing_edge_order_keeps_degrees((n, pairs) in arb_graph()) {
        let edges = EdgeIndex::from_pairs(&pairs, n).unwrap();
        let order: Vec<usize> = (0..pairs.len()).rev().collect();
        let reversed = edges.reordered(&order).unwrap();
        prop_assert_eq!(edges.in_degrees(), reversed.in_degrees());
    }

    #[test]
    fn packing_preserves_counts(graphs in prop::collection::vec(arb_graph(), 1..5)) {
        let parts: Vec<EdgeIndex> = graphs
            .iter()
            .map(|(n, pairs)| EdgeIndex::from_pairs(pairs, *n).unwrap())
            .collect();
        let packed = DisjointGraphs::pack(&parts).unwrap();

        let counts: Vec<usize> = parts.iter().map(EdgeIndex::num_nodes).collect();
        prop_assert_eq!(packed.node_counts(), counts);
        let edges: usize = parts.iter().map(EdgeIndex::num_edges).sum();
        prop_assert_eq!(packed.edges().num_edges(), edges);
    }
}
