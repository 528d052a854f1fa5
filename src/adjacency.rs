use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};




/**
 * The node adjacency of one partition: for every other partition, the global
 * IDs of the nodes the two share. Stored in both directions, like a two-way
 * edge list between ranks and nodes, so that the neighbors of a node can be
 * found as quickly as the nodes shared with a rank. Never contains the own
 * rank.
 */
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjacencyMap {
    rank: usize,
    by_rank: BTreeMap<usize, BTreeSet<u64>>,
    by_node: BTreeMap<u64, BTreeSet<usize>>,
}




// ============================================================================
impl AdjacencyMap {


    /**
     * Create an empty adjacency map for the given rank.
     */
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            ..Self::default()
        }
    }


    /**
     * Build the map from the node-to-partitions relation. Nodes whose owner
     * set does not include this rank are not local here and are skipped.
     */
    pub fn from_node_owners<I, R>(rank: usize, owners: I) -> Self
    where
        I: IntoIterator<Item = (u64, R)>,
        R: IntoIterator<Item = usize>,
    {
        let mut map = Self::new(rank);

        for (gid, ranks) in owners {
            let ranks: BTreeSet<usize> = ranks.into_iter().collect();

            if ranks.contains(&rank) {
                for p in ranks {
                    map.insert(p, gid);
                }
            }
        }
        map
    }


    /**
     * Record that the node is shared with partition `p`. Inserting the own
     * rank is a no-op.
     */
    pub fn insert(&mut self, p: usize, gid: u64) {
        if p != self.rank {
            self.by_rank.entry(p).or_default().insert(gid);
            self.by_node.entry(gid).or_default().insert(p);
        }
    }


    pub fn rank(&self) -> usize {
        self.rank
    }


    /**
     * Return the number of neighbor partitions.
     */
    pub fn len(&self) -> usize {
        self.by_rank.len()
    }


    pub fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }


    /**
     * Return the neighbor ranks in ascending order.
     */
    pub fn neighbors(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_rank.keys().copied()
    }


    pub fn is_neighbor(&self, p: usize) -> bool {
        self.by_rank.contains_key(&p)
    }


    /**
     * Return the global IDs shared with partition `p`, ascending.
     */
    pub fn shared_with(&self, p: usize) -> impl Iterator<Item = u64> + '_ {
        self.by_rank.get(&p).into_iter().flat_map(|gids| gids.iter().copied())
    }


    /**
     * Return the number of nodes shared with partition `p`.
     */
    pub fn num_shared_with(&self, p: usize) -> usize {
        self.by_rank.get(&p).map_or(0, BTreeSet::len)
    }


    /**
     * Return the partitions (other than this one) that hold the node.
     */
    pub fn neighbors_of_node(&self, gid: u64) -> impl Iterator<Item = usize> + '_ {
        self.by_node.get(&gid).into_iter().flat_map(|ranks| ranks.iter().copied())
    }


    pub fn is_shared(&self, gid: u64) -> bool {
        self.by_node.contains_key(&gid)
    }


    /**
     * Return every shared global ID once, ascending.
     */
    pub fn shared_nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_node.keys().copied()
    }


    /**
     * Return the partitions that may share the edge (a, b): those holding
     * both end points. Holding both end points does not imply holding the
     * edge, so the result still needs confirmation by the neighbor.
     */
    pub fn shares_edge_candidates(&self, a: u64, b: u64) -> BTreeSet<usize> {
        match (self.by_node.get(&a), self.by_node.get(&b)) {
            (Some(ra), Some(rb)) => ra.intersection(rb).copied().collect(),
            _ => BTreeSet::new(),
        }
    }


    /**
     * Return the map that results from a topology change: the removed nodes
     * are dropped and the added ones (per neighbor rank) are inserted.
     * Neighbors left without shared nodes disappear from the map.
     */
    pub fn rebuilt(&self, removed: &BTreeSet<u64>, added: &BTreeMap<usize, BTreeSet<u64>>) -> Self {
        let mut map = Self::new(self.rank);

        for (&p, gids) in &self.by_rank {
            for &gid in gids.difference(removed) {
                map.insert(p, gid);
            }
        }
        for (&p, gids) in added {
            for &gid in gids {
                map.insert(p, gid);
            }
        }
        map
    }


    /**
     * Verify that a group of maps (indexed by rank) is symmetric: p lists
     * gid as shared with q exactly when q lists it as shared with p.
     */
    pub fn check_symmetric(maps: &[AdjacencyMap]) -> Result<()> {
        for (p, map) in maps.iter().enumerate() {
            if map.rank != p {
                return Err(Error::InvalidMesh(format!("adjacency map at index {} belongs to rank {}", p, map.rank)));
            }
            for (&q, gids) in &map.by_rank {
                let theirs = maps
                    .get(q)
                    .and_then(|other| other.by_rank.get(&p))
                    .cloned()
                    .unwrap_or_default();

                if &theirs != gids {
                    return Err(Error::InvalidMesh(format!(
                        "rank {} shares {} nodes with rank {}, which shares {} back",
                        p,
                        gids.len(),
                        q,
                        theirs.len()
                    )));
                }
            }
        }
        Ok(())
    }
}
