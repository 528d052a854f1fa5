//! The per-partition mesh store: tetrahedral connectivity over local node
//! indexes, node coordinates, the bijection between local indexes and global
//! node IDs, the mesh generation, and the refinement history needed to undo
//! refinement later.

mod global;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adjacency::AdjacencyMap;
use crate::amr::{self, Edge, Family};
use crate::boundary::BoundaryIndex;
use crate::error::{Error, Result};
use crate::geometry::{tet_volume, Point, Tet};

pub use global::{distribute, GlobalMesh};




/// Counts completed topology changes. Every halo round and every refinement
/// message is tagged with the generation it belongs to.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "generation {}", self.0)
    }
}




/// The mesh data owned by one partition.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    rank: usize,
    inpoel: Vec<Tet>,
    coord: Vec<Point>,
    gid: Vec<u64>,
    #[serde(skip)]
    lid: HashMap<u64, usize>,
    generation: Generation,
    next_gid: u64,
    history: Vec<Family<u64>>,
}

impl Partition {
    /// Build a partition from elements given in global node IDs. Local
    /// indexes are assigned in ascending global ID order. `coord_of` must
    /// know the coordinates of every referenced node, and `next_gid` is the
    /// first global ID not used anywhere in the distributed mesh.
    ///
    pub fn new<F>(rank: usize, elements: &[[u64; 4]], coord_of: F, next_gid: u64) -> Result<Self>
    where
        F: Fn(u64) -> Option<Point>,
    {
        let gid: Vec<u64> = elements
            .iter()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let lid: HashMap<u64, usize> = gid.iter().enumerate().map(|(l, &g)| (g, l)).collect();

        let coord = gid
            .iter()
            .map(|&g| {
                coord_of(g).ok_or_else(|| Error::InvalidMesh(format!("[rank {}] node {} has no coordinates", rank, g)))
            })
            .collect::<Result<Vec<_>>>()?;

        let inpoel = elements
            .iter()
            .map(|t| [lid[&t[0]], lid[&t[1]], lid[&t[2]], lid[&t[3]]])
            .collect();

        Ok(Self {
            rank,
            inpoel,
            coord,
            gid,
            lid,
            generation: Generation::default(),
            next_gid,
            history: Vec::new(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn inpoel(&self) -> &[Tet] {
        &self.inpoel
    }

    pub fn coord(&self) -> &[Point] {
        &self.coord
    }

    pub fn gid(&self) -> &[u64] {
        &self.gid
    }

    pub fn lid(&self) -> &HashMap<u64, usize> {
        &self.lid
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn next_gid(&self) -> u64 {
        self.next_gid
    }

    pub fn history(&self) -> &[Family<u64>] {
        &self.history
    }

    pub fn num_nodes(&self) -> usize {
        self.gid.len()
    }

    pub fn num_elements(&self) -> usize {
        self.inpoel.len()
    }

    /// Return the local index of a global node ID, if the node is here.
    pub fn to_local(&self, gid: u64) -> Option<usize> {
        self.lid.get(&gid).copied()
    }

    /// Return element `e` in global node IDs.
    pub fn global_element(&self, e: usize) -> [u64; 4] {
        let t = &self.inpoel[e];
        [self.gid[t[0]], self.gid[t[1]], self.gid[t[2]], self.gid[t[3]]]
    }

    pub fn global_edge(&self, edge: &Edge) -> Edge<u64> {
        edge.map(|l| self.gid[l])
    }

    pub fn local_edge(&self, edge: &Edge<u64>) -> Option<Edge> {
        edge.try_map(|g| self.to_local(g).ok_or(())).ok()
    }

    /// Return the unique edges of the local mesh.
    pub fn edges(&self) -> BTreeSet<Edge> {
        amr::edges(&self.inpoel)
    }

    /// Signed element volumes, computed in parallel.
    ///
    pub fn element_volumes(&self) -> Vec<f64> {
        self.inpoel.par_iter().map(|t| tet_volume(t, &self.coord)).collect()
    }

    /// Each element's volume split equally between its four nodes and summed
    /// per node. These are this partition's contributions only; nodes on the
    /// partition boundary need the contributions of the neighbors as well.
    ///
    pub fn nodal_volumes(&self) -> Result<Vec<f64>> {
        let volumes = self.element_volumes();

        if let Some((e, &v)) = volumes.iter().enumerate().find(|(_, &v)| !(v > 0.0)) {
            return Err(Error::DegenerateElement {
                rank: self.rank,
                element: e,
                nodes: self.global_element(e),
                volume: v,
            });
        }

        let mut vol = vec![0.0; self.num_nodes()];

        for (t, v) in self.inpoel.iter().zip(&volumes) {
            for &n in t {
                vol[n] += v / 4.0;
            }
        }
        Ok(vol)
    }

    /// Replace the topology after a refinement or derefinement. The new
    /// connectivity, coordinates and global IDs must describe a valid store;
    /// the generation is not touched here.
    ///
    pub(crate) fn replace(
        &mut self,
        inpoel: Vec<Tet>,
        coord: Vec<Point>,
        gid: Vec<u64>,
        history: Vec<Family<u64>>,
        next_gid: u64,
    ) -> Result<()> {
        self.inpoel = inpoel;
        self.coord = coord;
        self.gid = gid;
        self.history = history;
        self.next_gid = next_gid;
        self.lid = self.gid.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        self.check()
    }

    pub(crate) fn advance_generation(&mut self) {
        self.generation = self.generation.next();
    }

    /// Verify the store invariants: the ID maps are mutual inverses, every
    /// element references existing nodes, and every node is referenced.
    ///
    pub fn check(&self) -> Result<()> {
        let fail = |detail: String| Err(Error::InvalidMesh(format!("[rank {}] {}", self.rank, detail)));

        if self.coord.len() != self.gid.len() {
            return fail(format!("{} coordinates for {} nodes", self.coord.len(), self.gid.len()));
        }
        if self.lid.len() != self.gid.len() {
            return fail("global node IDs are not unique".into());
        }
        let mut referenced = vec![false; self.num_nodes()];

        for (e, t) in self.inpoel.iter().enumerate() {
            for &n in t {
                match referenced.get_mut(n) {
                    Some(r) => *r = true,
                    None => return fail(format!("element {} references missing node {}", e, n)),
                }
            }
        }
        if let Some(n) = referenced.iter().position(|r| !r) {
            return fail(format!("node {} (global {}) is not referenced", n, self.gid[n]));
        }
        Ok(())
    }

    /// Encode the store, the adjacency map and the boundary index derived
    /// from it as a CBOR byte buffer.
    ///
    pub fn snapshot(&self, adjacency: &AdjacencyMap) -> Result<Vec<u8>> {
        let boundary = BoundaryIndex::build(adjacency);
        let mut buffer = Vec::new();

        ciborium::ser::into_writer(&(self, adjacency, &boundary), &mut buffer)
            .map_err(|e| Error::Snapshot(e.to_string()))?;
        Ok(buffer)
    }

    /// Decode a buffer written by [`Partition::snapshot`].
    ///
    pub fn restore(bytes: &[u8]) -> Result<(Self, AdjacencyMap, BoundaryIndex)> {
        let (mut partition, adjacency, boundary): (Self, AdjacencyMap, BoundaryIndex) =
            ciborium::de::from_reader(bytes).map_err(|e| Error::Snapshot(e.to_string()))?;

        partition.lid = partition.gid.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        partition.check().map_err(|e| Error::Snapshot(e.to_string()))?;
        Ok((partition, adjacency, boundary))
    }
}
