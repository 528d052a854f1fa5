use std::collections::{BTreeMap, BTreeSet};

use crate::adjacency::AdjacencyMap;
use crate::error::{Error, Result};
use crate::geometry::{orient, Point};

use super::Partition;




/**
 * A whole tetrahedral mesh in global node IDs: the input that gets split up
 * between partitions.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalMesh {
    pub elements: Vec<[u64; 4]>,
    pub coord: Vec<Point>,
}




// ============================================================================
impl GlobalMesh {


    /**
     * Generate the unit cube with `n` cells per direction, each cell cut
     * into six tetrahedra around its main diagonal (Kuhn subdivision). All
     * cells cut the same way, so the mesh is conforming. Elements are
     * positively oriented and listed cell by cell, x fastest.
     */
    pub fn cube(n: usize) -> Self {
        let m = n + 1;
        let h = 1.0 / n as f64;
        let node = |i: usize, j: usize, k: usize| i + m * (j + m * k);

        let mut coord = Vec::with_capacity(m * m * m);

        for k in 0..m {
            for j in 0..m {
                for i in 0..m {
                    coord.push([i as f64 * h, j as f64 * h, k as f64 * h]);
                }
            }
        }

        let axes = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let mut elements = Vec::with_capacity(6 * n * n * n);

        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    for order in &axes {
                        let mut corner = [i, j, k];
                        let mut tet = [node(i, j, k); 4];

                        for (step, &axis) in order.iter().enumerate() {
                            corner[axis] += 1;
                            tet[step + 1] = node(corner[0], corner[1], corner[2]);
                        }
                        let tet = orient(tet, &coord);
                        elements.push([tet[0] as u64, tet[1] as u64, tet[2] as u64, tet[3] as u64]);
                    }
                }
            }
        }
        Self { elements, coord }
    }


    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }


    pub fn num_nodes(&self) -> usize {
        self.coord.len()
    }


    /**
     * Assign each element to one of `nparts` slabs of equal width along x,
     * by the x coordinate of its centroid.
     */
    pub fn slabs(&self, nparts: usize) -> Vec<usize> {
        let lo = self.coord.iter().map(|x| x[0]).fold(f64::INFINITY, f64::min);
        let hi = self.coord.iter().map(|x| x[0]).fold(f64::NEG_INFINITY, f64::max);
        let width = (hi - lo).max(f64::MIN_POSITIVE);

        self.elements
            .iter()
            .map(|tet| {
                let cx = tet.iter().map(|&g| self.coord[g as usize][0]).sum::<f64>() / 4.0;
                (((cx - lo) / width * nparts as f64) as usize).min(nparts.saturating_sub(1))
            })
            .collect()
    }


    /**
     * Return, for every node, the set of partitions holding an element that
     * references it.
     */
    pub fn node_owners(&self, assignment: &[usize]) -> BTreeMap<u64, BTreeSet<usize>> {
        let mut owners: BTreeMap<u64, BTreeSet<usize>> = BTreeMap::new();

        for (tet, &p) in self.elements.iter().zip(assignment) {
            for &g in tet {
                owners.entry(g).or_default().insert(p);
            }
        }
        owners
    }
}




/**
 * Split a global mesh into partitions according to an element-to-rank
 * assignment, returning each partition's mesh store together with its
 * adjacency map. Partitions are indexed by rank; a rank that receives no
 * elements gets an empty store.
 */
pub fn distribute(global: &GlobalMesh, assignment: &[usize], nparts: usize) -> Result<Vec<(Partition, AdjacencyMap)>> {
    if nparts == 0 {
        return Err(Error::InvalidMesh("cannot distribute over zero partitions".into()));
    }
    if assignment.len() != global.num_elements() {
        return Err(Error::InvalidMesh(format!(
            "assignment has {} entries for {} elements",
            assignment.len(),
            global.num_elements()
        )));
    }
    if let Some((e, p)) = assignment.iter().enumerate().find(|(_, &p)| p >= nparts) {
        return Err(Error::InvalidMesh(format!("element {} is assigned to rank {} of {}", e, p, nparts)));
    }

    let owners = global.node_owners(assignment);
    let mut elements = vec![Vec::new(); nparts];

    for (tet, &p) in global.elements.iter().zip(assignment) {
        elements[p].push(*tet);
    }

    elements
        .iter()
        .enumerate()
        .map(|(rank, local)| {
            let partition = Partition::new(
                rank,
                local,
                |g| global.coord.get(g as usize).copied(),
                global.num_nodes() as u64,
            )?;
            let adjacency = AdjacencyMap::from_node_owners(
                rank,
                owners.iter().map(|(&g, ranks)| (g, ranks.iter().copied())),
            );
            Ok((partition, adjacency))
        })
        .collect()
}
