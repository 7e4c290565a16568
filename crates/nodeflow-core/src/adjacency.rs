//! Adjacency representations.
//!
//! Sparse adjacency uses matrix coordinates: an edge `(row, col)` is the
//! non-zero entry `A[row][col]`, so node `row` receives a message from node
//! `col`. This is the convention of the dense product `A · X`, which keeps
//! the dense and sparse paths interchangeable.
//!
//! ```text
//!        col (source)
//!      ┌─────────────┐
//!  row │ . 1 . . .   │   (0, 1): node 0 aggregates x_1
//!      │ 1 . 1 . .   │   (1, 0), (1, 2): node 1 aggregates x_0 + x_2
//!      │ . . . . .   │
//!      │ . . . 1 .   │   (3, 3): self-loop
//!      └─────────────┘
//! ```

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::mode::{AdjacencyKind, Mode};

/// Sparse adjacency: an edge list in COO layout with optional weights.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeIndex {
    num_nodes: usize,
    /// Receiving node of each edge (matrix row).
    targets: Vec<u32>,
    /// Sending node of each edge (matrix column).
    sources: Vec<u32>,
    weights: Option<Vec<f32>>,
}

impl EdgeIndex {
    /// Create an edge index from parallel row/column vectors.
    ///
    /// Fails with [`Error::ShapeMismatch`] when the vectors differ in length,
    /// when an endpoint lies outside `[0, num_nodes)`, or when `weights` does
    /// not hold exactly one value per edge.
    pub fn new(
        num_nodes: usize,
        targets: Vec<u32>,
        sources: Vec<u32>,
        weights: Option<Vec<f32>>,
    ) -> Result<Self> {
        if targets.len() != sources.len() {
            return Err(Error::shape(format!(
                "edge index has {} rows but {} columns",
                targets.len(),
                sources.len()
            )));
        }
        if let Some(w) = &weights {
            if w.len() != targets.len() {
                return Err(Error::shape(format!(
                    "{} edge weights for {} edges",
                    w.len(),
                    targets.len()
                )));
            }
        }
        let out_of_range = targets
            .iter()
            .chain(sources.iter())
            .find(|&&i| i as usize >= num_nodes);
        if let Some(&i) = out_of_range {
            return Err(Error::shape(format!(
                "edge endpoint {i} outside [0, {num_nodes})"
            )));
        }
        Ok(Self {
            num_nodes,
            targets,
            sources,
            weights,
        })
    }

    /// Create an unweighted edge index from `(row, col)` pairs.
    pub fn from_pairs(pairs: &[(u32, u32)], num_nodes: usize) -> Result<Self> {
        let (targets, sources) = pairs.iter().copied().unzip();
        Self::new(num_nodes, targets, sources, None)
    }

    /// A graph with `num_nodes` nodes and no edges.
    pub fn empty(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            targets: Vec::new(),
            sources: Vec::new(),
            weights: None,
        }
    }

    /// Attach one weight per edge.
    pub fn with_weights(self, weights: Vec<f32>) -> Result<Self> {
        Self::new(self.num_nodes, self.targets, self.sources, Some(weights))
    }

    /// Build from the non-zero entries of a dense `(N, N)` matrix.
    ///
    /// Entry values become edge weights. Edges are listed in row-major order.
    pub fn from_dense(a: &Tensor) -> Result<Self> {
        let (n, m) = a.dims2()?;
        if n != m {
            return Err(Error::shape(format!("dense adjacency must be square, got ({n}, {m})")));
        }
        let rows = a.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut targets = Vec::new();
        let mut sources = Vec::new();
        let mut weights = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    targets.push(i as u32);
                    sources.push(j as u32);
                    weights.push(v);
                }
            }
        }
        Self::new(n, targets, sources, Some(weights))
    }

    /// Materialize as a dense `(N, N)` f32 matrix. Duplicate edges add up.
    pub fn to_dense(&self, device: &Device) -> Result<Tensor> {
        let n = self.num_nodes;
        let mut data = vec![0f32; n * n];
        for (e, (&t, &s)) in self.targets.iter().zip(&self.sources).enumerate() {
            data[t as usize * n + s as usize] += self.weight(e);
        }
        Ok(Tensor::from_vec(data, (n, n), device)?)
    }

    /// Convert a petgraph graph. Each directed edge `a -> b` becomes the entry
    /// `(b, a)`; undirected edges are inserted in both directions.
    #[cfg(feature = "petgraph")]
    pub fn from_petgraph<N, E, Ty, Ix>(graph: &petgraph::Graph<N, E, Ty, Ix>) -> Result<Self>
    where
        Ty: petgraph::EdgeType,
        Ix: petgraph::graph::IndexType,
    {
        use petgraph::visit::EdgeRef;

        let mut targets = Vec::new();
        let mut sources = Vec::new();
        for edge in graph.edge_references() {
            let (a, b) = (edge.source().index() as u32, edge.target().index() as u32);
            targets.push(b);
            sources.push(a);
            if !graph.is_directed() && a != b {
                targets.push(a);
                sources.push(b);
            }
        }
        Self::new(graph.node_count(), targets, sources, None)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.targets.len()
    }

    /// Receiving node of each edge.
    pub fn targets(&self) -> &[u32] {
        &self.targets
    }

    /// Sending node of each edge.
    pub fn sources(&self) -> &[u32] {
        &self.sources
    }

    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    /// Weight of edge `e`, 1.0 for unweighted edge lists.
    pub fn weight(&self, e: usize) -> f32 {
        self.weights.as_ref().map_or(1.0, |w| w[e])
    }

    /// `(row, col)` pairs in edge order.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.targets.iter().copied().zip(self.sources.iter().copied())
    }

    /// Number of incoming edges per node.
    pub fn in_degrees(&self) -> Vec<usize> {
        let mut deg = vec![0usize; self.num_nodes];
        for &t in &self.targets {
            deg[t as usize] += 1;
        }
        deg
    }

    /// Sum of incoming edge weights per node (row sums of `A`).
    pub fn weighted_degrees(&self) -> Vec<f32> {
        let mut deg = vec![0f32; self.num_nodes];
        for (e, &t) in self.targets.iter().enumerate() {
            deg[t as usize] += self.weight(e);
        }
        deg
    }

    pub fn has_self_loops(&self) -> bool {
        self.pairs().any(|(t, s)| t == s)
    }

    /// Replace existing self-loops with exactly one unit-weight loop per node.
    pub fn with_self_loops(&self) -> Self {
        let n = self.num_nodes;
        let keep: Vec<usize> = (0..self.num_edges())
            .filter(|&e| self.targets[e] != self.sources[e])
            .collect();
        let mut targets: Vec<u32> = keep.iter().map(|&e| self.targets[e]).collect();
        let mut sources: Vec<u32> = keep.iter().map(|&e| self.sources[e]).collect();
        targets.extend(0..n as u32);
        sources.extend(0..n as u32);
        let weights = self.weights.as_ref().map(|w| {
            let mut w: Vec<f32> = keep.iter().map(|&e| w[e]).collect();
            w.extend(std::iter::repeat(1.0).take(n));
            w
        });
        Self {
            num_nodes: n,
            targets,
            sources,
            weights,
        }
    }

    /// Reorder edges: edge `i` of the result is edge `order[i]` of `self`.
    pub fn reordered(&self, order: &[usize]) -> Result<Self> {
        let m = self.num_edges();
        let mut seen = vec![false; m];
        for &e in order {
            if e >= m || std::mem::replace(&mut seen[e], true) {
                return Err(Error::shape(format!(
                    "edge order is not a permutation of 0..{m}"
                )));
            }
        }
        if order.len() != m {
            return Err(Error::shape(format!(
                "edge order has {} entries for {m} edges",
                order.len()
            )));
        }
        Ok(Self {
            num_nodes: self.num_nodes,
            targets: order.iter().map(|&e| self.targets[e]).collect(),
            sources: order.iter().map(|&e| self.sources[e]).collect(),
            weights: self
                .weights
                .as_ref()
                .map(|w| order.iter().map(|&e| w[e]).collect()),
        })
    }

    /// `(targets, sources)` as u32 index tensors.
    pub fn index_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let t = Tensor::new(self.targets.as_slice(), device)?;
        let s = Tensor::new(self.sources.as_slice(), device)?;
        Ok((t, s))
    }

    /// Edge weights as an `(E,)` f32 tensor, if any.
    pub fn weight_tensor(&self, device: &Device) -> Result<Option<Tensor>> {
        self.weights
            .as_ref()
            .map(|w| Tensor::new(w.as_slice(), device).map_err(Error::from))
            .transpose()
    }

    pub(crate) fn map_weights(&self, f: impl Fn(usize, u32, u32, f32) -> f32) -> Self {
        let weights = (0..self.num_edges())
            .map(|e| f(e, self.targets[e], self.sources[e], self.weight(e)))
            .collect();
        Self {
            num_nodes: self.num_nodes,
            targets: self.targets.clone(),
            sources: self.sources.clone(),
            weights: Some(weights),
        }
    }
}

/// Many small graphs packed into one block-diagonal edge list.
#[derive(Debug, Clone, PartialEq)]
pub struct DisjointGraphs {
    edges: EdgeIndex,
    graph_ids: Vec<u32>,
    num_graphs: usize,
}

impl DisjointGraphs {
    /// Wrap a packed edge list with the graph id of every node.
    ///
    /// Graph ids must be non-decreasing (nodes of a graph are contiguous) and
    /// no edge may connect two graphs.
    pub fn new(edges: EdgeIndex, graph_ids: Vec<u32>) -> Result<Self> {
        if graph_ids.len() != edges.num_nodes() {
            return Err(Error::shape(format!(
                "{} graph ids for {} nodes",
                graph_ids.len(),
                edges.num_nodes()
            )));
        }
        if graph_ids.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::shape("graph ids must be non-decreasing"));
        }
        if let Some((t, s)) = edges
            .pairs()
            .find(|&(t, s)| graph_ids[t as usize] != graph_ids[s as usize])
        {
            return Err(Error::shape(format!(
                "edge ({t}, {s}) connects graph {} to graph {}",
                graph_ids[t as usize], graph_ids[s as usize]
            )));
        }
        let num_graphs = graph_ids.last().map_or(0, |&g| g as usize + 1);
        Ok(Self {
            edges,
            graph_ids,
            num_graphs,
        })
    }

    /// Pack per-graph edge lists, offsetting node indices.
    ///
    /// If any graph is weighted, unweighted graphs get unit weights.
    pub fn pack(graphs: &[EdgeIndex]) -> Result<Self> {
        let total = graphs.iter().try_fold(0u32, |acc, g| {
            u32::try_from(g.num_nodes()).ok().and_then(|n| acc.checked_add(n))
        });
        let Some(total) = total else {
            return Err(Error::shape(format!(
                "{} graphs hold more than {} nodes in total",
                graphs.len(),
                u32::MAX
            )));
        };
        if u32::try_from(graphs.len()).is_err() {
            return Err(Error::shape(format!("cannot pack {} graphs", graphs.len())));
        }

        let weighted = graphs.iter().any(|g| g.weights().is_some());
        let mut targets = Vec::new();
        let mut sources = Vec::new();
        let mut weights = Vec::new();
        let mut graph_ids = Vec::with_capacity(total as usize);
        let mut offset = 0u32;
        for (g, graph) in (0u32..).zip(graphs) {
            targets.extend(graph.targets().iter().map(|&t| t + offset));
            sources.extend(graph.sources().iter().map(|&s| s + offset));
            if weighted {
                weights.extend((0..graph.num_edges()).map(|e| graph.weight(e)));
            }
            graph_ids.extend(std::iter::repeat(g).take(graph.num_nodes()));
            // fits: every prefix sum is at most `total`
            offset += graph.num_nodes() as u32;
        }
        let edges = EdgeIndex::new(
            total as usize,
            targets,
            sources,
            weighted.then_some(weights),
        )?;
        // trailing empty graphs leave no node ids behind
        let mut packed = Self::new(edges, graph_ids)?;
        packed.num_graphs = graphs.len();
        Ok(packed)
    }

    pub fn edges(&self) -> &EdgeIndex {
        &self.edges
    }

    /// Graph id of every packed node.
    pub fn graph_ids(&self) -> &[u32] {
        &self.graph_ids
    }

    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }

    /// Number of nodes in each graph.
    pub fn node_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_graphs];
        for &g in &self.graph_ids {
            counts[g as usize] += 1;
        }
        counts
    }
}

/// The adjacency of one forward call, tagged with its execution mode.
///
/// `Mixed` and `Disjoint` both carry edge lists but mean different things: a
/// mixed adjacency is one graph shared by a batch of feature sets `(B, N, F)`,
/// a disjoint one is many graphs whose nodes are stacked in `(N, F)`.
#[derive(Debug, Clone)]
pub enum Adjacency {
    Dense(Tensor),
    Sparse(EdgeIndex),
    Disjoint(DisjointGraphs),
    Mixed(EdgeIndex),
    Batch(Tensor),
}

impl Adjacency {
    /// Single-mode dense adjacency; `a` must be `(N, N)`.
    pub fn dense(a: Tensor) -> Result<Self> {
        let adj = Self::Dense(a);
        adj.num_nodes()?;
        Ok(adj)
    }

    /// Batch-mode dense adjacency; `a` must be `(B, N, N)`.
    pub fn batch(a: Tensor) -> Result<Self> {
        let adj = Self::Batch(a);
        adj.num_nodes()?;
        Ok(adj)
    }

    pub fn kind(&self) -> AdjacencyKind {
        match self {
            Self::Dense(_) => AdjacencyKind::Dense,
            Self::Sparse(_) => AdjacencyKind::Sparse,
            Self::Disjoint(_) => AdjacencyKind::Disjoint,
            Self::Mixed(_) => AdjacencyKind::Mixed,
            Self::Batch(_) => AdjacencyKind::Batch,
        }
    }

    pub fn mode(&self) -> Mode {
        self.kind().mode()
    }

    /// Number of nodes per graph (per sample in batch mode).
    pub fn num_nodes(&self) -> Result<usize> {
        match self {
            Self::Dense(a) => {
                let (n, m) = a.dims2()?;
                if n != m {
                    return Err(Error::shape(format!(
                        "dense adjacency must be square, got ({n}, {m})"
                    )));
                }
                Ok(n)
            }
            Self::Batch(a) => {
                let (_, n, m) = a.dims3()?;
                if n != m {
                    return Err(Error::shape(format!(
                        "batch adjacency must be (B, N, N), got {:?}",
                        a.dims()
                    )));
                }
                Ok(n)
            }
            Self::Sparse(e) | Self::Mixed(e) => Ok(e.num_nodes()),
            Self::Disjoint(d) => Ok(d.edges().num_nodes()),
        }
    }

    /// Batch size for batch mode.
    pub fn batch_size(&self) -> Result<Option<usize>> {
        match self {
            Self::Batch(a) => Ok(Some(a.dim(0)?)),
            _ => Ok(None),
        }
    }

    /// The edge list of sparse kinds.
    pub fn edges(&self) -> Option<&EdgeIndex> {
        match self {
            Self::Sparse(e) | Self::Mixed(e) => Some(e),
            Self::Disjoint(d) => Some(d.edges()),
            Self::Dense(_) | Self::Batch(_) => None,
        }
    }

    /// The dense matrix of dense kinds.
    pub fn matrix(&self) -> Option<&Tensor> {
        match self {
            Self::Dense(a) | Self::Batch(a) => Some(a),
            _ => None,
        }
    }

    /// Same representation with the edge list transformed; dense kinds are
    /// returned unchanged.
    pub fn map_edges(&self, f: impl FnOnce(&EdgeIndex) -> EdgeIndex) -> Result<Self> {
        Ok(match self {
            Self::Sparse(e) => Self::Sparse(f(e)),
            Self::Mixed(e) => Self::Mixed(f(e)),
            Self::Disjoint(d) => {
                let mut mapped = DisjointGraphs::new(f(d.edges()), d.graph_ids().to_vec())?;
                mapped.num_graphs = d.num_graphs;
                Self::Disjoint(mapped)
            }
            Self::Dense(_) | Self::Batch(_) => self.clone(),
        })
    }
}

impl From<EdgeIndex> for Adjacency {
    fn from(edges: EdgeIndex) -> Self {
        Self::Sparse(edges)
    }
}

impl From<DisjointGraphs> for Adjacency {
    fn from(graphs: DisjointGraphs) -> Self {
        Self::Disjoint(graphs)
    }
}
