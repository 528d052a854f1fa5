//! The numerical scheme collaborating with the driver, and the capability
//! the refiner uses to tell it (and anything else holding per-node state)
//! about topology changes.

mod decay;
pub mod registry;

use std::collections::BTreeMap;

use crate::adjacency::AdjacencyMap;
use crate::error::Result;
use crate::geometry::{Point, Tet};
use crate::mesh::{Generation, Partition};

pub use decay::Decay;




/// Describes one completed refinement or derefinement pass. Node indexes
/// are local to the partition: `node_map[old]` is the new index of an old
/// node (`None` if the node was removed), and `added_node_parents` gives the
/// two end points (new indexes) of the edge each added node bisects.
///
#[derive(Clone, Debug, PartialEq)]
pub struct MeshChange {
    pub generation: Generation,
    pub connectivity: Vec<Tet>,
    pub coordinates: Vec<Point>,
    pub added_node_parents: BTreeMap<usize, (usize, usize)>,
    pub node_map: Vec<Option<usize>>,
    pub adjacency: AdjacencyMap,
}

impl MeshChange {
    pub fn num_nodes(&self) -> usize {
        self.coordinates.len()
    }

    /// Carry a node field with `width` components per node over to the new
    /// mesh. Surviving nodes keep their values; added nodes get the average
    /// of their parents.
    pub fn interpolate(&self, field: &[f64], width: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.num_nodes() * width];

        for (old, new) in self.node_map.iter().enumerate() {
            if let Some(new) = new {
                out[new * width..(new + 1) * width].copy_from_slice(&field[old * width..(old + 1) * width]);
            }
        }
        for (&node, &(a, b)) in &self.added_node_parents {
            for c in 0..width {
                out[node * width + c] = 0.5 * (out[a * width + c] + out[b * width + c]);
            }
        }
        out
    }
}




/// Anything that holds per-node or per-element state and must follow the
/// mesh through topology changes.
///
pub trait SchemeAdapter {
    /// Called once after every pass that changed the topology. Failures are
    /// the implementor's to log; there is nothing to return.
    fn on_mesh_changed(&mut self, change: &MeshChange);
}

/// The numerical collaborator of the driver. Node arrays have `nprop()`
/// components per node. `lhs` and `rhs` return this partition's
/// contributions only; the driver merges them across partitions before
/// solving.
///
pub trait Scheme: SchemeAdapter + Send {
    fn names(&self) -> Vec<String>;

    fn nprop(&self) -> usize;

    fn initialize(&mut self, partition: &Partition, t: f64);

    fn lhs(&self, partition: &Partition) -> Result<Vec<f64>>;

    fn rhs(&self, partition: &Partition, t: f64, dt: f64) -> Result<Vec<f64>>;

    /// A stable step size for the current solution, before the CFL factor.
    fn suggest_dt(&self, partition: &Partition) -> f64;

    fn update(&mut self, du: &[f64]);

    fn solution(&self) -> &[f64];

    /// A node field whose jumps across edges drive error-based refinement.
    fn error_indicator(&self) -> Vec<f64> {
        let n = self.nprop().max(1);
        self.solution().iter().step_by(n).copied().collect()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn interpolation_averages_parents_and_follows_the_node_map() {
        let change = MeshChange {
            generation: Generation(1),
            connectivity: vec![],
            coordinates: vec![[0.0; 3]; 3],
            added_node_parents: [(2, (0, 1))].into_iter().collect(),
            node_map: vec![Some(1), None, Some(0)],
            adjacency: AdjacencyMap::new(0),
        };
        let field = vec![1.0, 10.0, 100.0, 2.0, 20.0, 200.0];
        assert_eq!(change.interpolate(&field, 2), vec![20.0, 200.0, 1.0, 10.0, 10.5, 105.0]);
    }
}
