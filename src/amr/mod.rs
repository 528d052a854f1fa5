//! Partition-local edge-based mesh refinement. Everything in this module
//! operates on one chunk of tetrahedral connectivity given as local node
//! indexes; it knows nothing about global node IDs or neighboring
//! partitions. Making the local decisions agree across partition boundaries
//! is the job of [`crate::refiner`].
//!
//! Refinement works by marking edges. Each element is then replaced by the
//! template matching its set of marked edges: one edge is bisected (1:2),
//! the three edges of one face are quadrisected (1:4), and all six edges give
//! the regular 1:8 subdivision. Any other pattern is promoted to 1:8 by
//! [`conform`] before the mesh is touched, which keeps the local mesh
//! conforming.

mod deref;
mod template;

use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{in_box, Point, Tet};

pub use deref::{apply_derefinement, deref_closure, derefinement_candidates, Derefinement};
pub use template::{apply_refinement, classify, conform, pattern, Refinement, Template, TET_EDGES};




/// An unordered pair of node indexes, stored with the smaller one first. On
/// the engine side the nodes are local indexes; the coordinator uses the same
/// type over global node IDs.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge<N = usize>(N, N);

impl<N: Ord + Copy> Edge<N> {
    pub fn new(a: N, b: N) -> Self {
        if a <= b {
            Edge(a, b)
        } else {
            Edge(b, a)
        }
    }

    pub fn nodes(&self) -> (N, N) {
        (self.0, self.1)
    }

    pub fn map<M: Ord + Copy, F: Fn(N) -> M>(&self, f: F) -> Edge<M> {
        Edge::new(f(self.0), f(self.1))
    }

    pub fn try_map<M, E, F>(&self, f: F) -> std::result::Result<Edge<M>, E>
    where
        M: Ord + Copy,
        F: Fn(N) -> std::result::Result<M, E>,
    {
        Ok(Edge::new(f(self.0)?, f(self.1)?))
    }
}




/// Refinement state of an edge. The ordering is the refinement level: when
/// two partitions hold different states for the same shared edge, the higher
/// one wins.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeState {
    Unrefined,
    /// Split because a neighboring partition split it; set during correction.
    Locked,
    Refined,
}

impl EdgeState {
    pub fn is_split(self) -> bool {
        self != EdgeState::Unrefined
    }

    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}




/// One refined element: the parent connectivity, its children, and each
/// split parent edge with the node inserted at its midpoint. Families are
/// what derefinement undoes.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Family<N = usize> {
    pub parent: [N; 4],
    pub children: Vec<[N; 4]>,
    pub splits: Vec<(Edge<N>, N)>,
}

impl<N: Ord + Copy> Family<N> {
    pub fn try_map<M, E, F>(&self, f: F) -> std::result::Result<Family<M>, E>
    where
        M: Ord + Copy,
        F: Fn(N) -> std::result::Result<M, E>,
    {
        let tet = |t: &[N; 4]| -> std::result::Result<[M; 4], E> {
            Ok([f(t[0])?, f(t[1])?, f(t[2])?, f(t[3])?])
        };
        Ok(Family {
            parent: tet(&self.parent)?,
            children: self.children.iter().map(tet).collect::<std::result::Result<_, _>>()?,
            splits: self
                .splits
                .iter()
                .map(|(e, m)| Ok((e.try_map(&f)?, f(*m)?)))
                .collect::<std::result::Result<_, _>>()?,
        })
    }
}




/// Rule for selecting the edges to refine (or to un-split, when given to
/// [`derefinement_candidates`]).
///
#[derive(Clone, Debug, PartialEq)]
pub enum Criterion {
    /// Every edge.
    Uniform,
    /// Edges across which a node field jumps by more than the threshold (or,
    /// for derefinement, by less than it).
    ErrorIndicator { field: Vec<f64>, threshold: f64 },
    /// Explicitly listed edges; edges not present in the mesh are ignored.
    EdgeList(Vec<Edge>),
    /// Edges with both end points inside a box.
    Region { lower: Point, upper: Point },
}

/// The absolute jump of a node field across an edge.
///
pub fn edge_error(field: &[f64], edge: &Edge) -> f64 {
    let (a, b) = edge.nodes();
    (field[a] - field[b]).abs()
}

/// Return the unique edges of a tetrahedral connectivity.
///
pub fn edges(inpoel: &[Tet]) -> BTreeSet<Edge> {
    inpoel
        .iter()
        .flat_map(|tet| TET_EDGES.iter().map(move |&(i, j)| Edge::new(tet[i], tet[j])))
        .collect()
}

/// Select the edges to refine according to the criterion. The returned set
/// is not yet closed under the refinement templates; see [`conform`].
///
pub fn mark_edges(inpoel: &[Tet], coord: &[Point], criterion: &Criterion) -> Result<BTreeSet<Edge>> {
    let all = edges(inpoel);

    match criterion {
        Criterion::Uniform => Ok(all),
        Criterion::ErrorIndicator { field, threshold } => {
            check_field(field, coord)?;
            Ok(all
                .par_iter()
                .filter(|e| edge_error(field, e) > *threshold)
                .copied()
                .collect())
        }
        Criterion::EdgeList(list) => Ok(list.iter().filter(|e| all.contains(e)).copied().collect()),
        Criterion::Region { lower, upper } => Ok(all
            .into_iter()
            .filter(|e| {
                let (a, b) = e.nodes();
                in_box(coord[a], *lower, *upper) && in_box(coord[b], *lower, *upper)
            })
            .collect()),
    }
}

fn check_field(field: &[f64], coord: &[Point]) -> Result<()> {
    if field.len() != coord.len() {
        return Err(Error::InvalidMesh(format!(
            "error indicator has {} values for {} nodes",
            field.len(),
            coord.len()
        )));
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    fn unit_tet() -> (Vec<Tet>, Vec<Point>) {
        let coord = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        (vec![[0, 1, 2, 3]], coord)
    }

    #[test]
    fn edges_are_unordered_pairs() {
        assert_eq!(Edge::new(3, 1), Edge::new(1, 3));
        assert_eq!(Edge::new(3, 1).nodes(), (1, 3));
    }

    #[test]
    fn higher_state_wins_the_merge() {
        assert_eq!(EdgeState::Unrefined.merge(EdgeState::Refined), EdgeState::Refined);
        assert_eq!(EdgeState::Locked.merge(EdgeState::Unrefined), EdgeState::Locked);
        assert!(EdgeState::Locked.is_split());
    }

    #[test]
    fn a_tet_has_six_edges() {
        let (inpoel, _) = unit_tet();
        assert_eq!(edges(&inpoel).len(), 6);
    }

    #[test]
    fn uniform_marks_every_edge() {
        let (inpoel, coord) = unit_tet();
        assert_eq!(mark_edges(&inpoel, &coord, &Criterion::Uniform).unwrap().len(), 6);
    }

    #[test]
    fn error_indicator_marks_edges_with_large_jumps() {
        let (inpoel, coord) = unit_tet();
        let field = vec![0.0, 1.0, 0.0, 0.0];
        let criterion = Criterion::ErrorIndicator { field, threshold: 0.5 };
        let marked = mark_edges(&inpoel, &coord, &criterion).unwrap();
        assert_eq!(marked.len(), 3);
        assert!(marked.iter().all(|e| e.nodes().0 == 1 || e.nodes().1 == 1));
    }

    #[test]
    fn error_indicator_with_wrong_length_is_rejected() {
        let (inpoel, coord) = unit_tet();
        let criterion = Criterion::ErrorIndicator { field: vec![0.0], threshold: 0.5 };
        assert!(mark_edges(&inpoel, &coord, &criterion).is_err());
    }

    #[test]
    fn edge_list_ignores_edges_not_in_the_mesh() {
        let (inpoel, coord) = unit_tet();
        let criterion = Criterion::EdgeList(vec![Edge::new(0, 1), Edge::new(0, 9)]);
        let marked = mark_edges(&inpoel, &coord, &criterion).unwrap();
        assert_eq!(marked.into_iter().collect::<Vec<_>>(), vec![Edge::new(0, 1)]);
    }

    #[test]
    fn region_requires_both_end_points_inside() {
        let (inpoel, coord) = unit_tet();
        let criterion = Criterion::Region {
            lower: [-0.1, -0.1, -0.1],
            upper: [1.1, 0.1, 0.1],
        };
        let marked = mark_edges(&inpoel, &coord, &criterion).unwrap();
        assert_eq!(marked.into_iter().collect::<Vec<_>>(), vec![Edge::new(0, 1)]);
    }
}
