use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adjacency::AdjacencyMap;




/**
 * Dense numbering of the nodes a partition shares with any neighbor. Each
 * distinct shared global ID gets one slot, in ascending global ID order, so
 * accumulator buffers need only `len() * width` reals. Rebuilt whenever the
 * adjacency map is.
 */
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryIndex {
    slots: BTreeMap<u64, usize>,
}




// ============================================================================
impl BoundaryIndex {


    pub fn build(adjacency: &AdjacencyMap) -> Self {
        Self {
            slots: adjacency.shared_nodes().enumerate().map(|(slot, gid)| (gid, slot)).collect(),
        }
    }


    /**
     * Return the slot of a shared global ID, or `None` for interior nodes.
     */
    pub fn slot(&self, gid: u64) -> Option<usize> {
        self.slots.get(&gid).copied()
    }


    pub fn len(&self) -> usize {
        self.slots.len()
    }


    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }


    /**
     * Iterate over (global ID, slot) pairs in ascending order.
     */
    pub fn iter(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.slots.iter().map(|(&gid, &slot)| (gid, slot))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;


    #[test]
    fn slots_are_dense_and_ascending() {
        let owners = vec![(40, vec![0, 2]), (7, vec![0, 1]), (19, vec![0, 1, 2]), (3, vec![0])];
        let index = BoundaryIndex::build(&AdjacencyMap::from_node_owners(0, owners));

        assert_eq!(index.len(), 3);
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![(7, 0), (19, 1), (40, 2)]);
        assert_eq!(index.slot(3), None);
    }


    #[test]
    fn empty_adjacency_gives_empty_index() {
        assert!(BoundaryIndex::build(&AdjacencyMap::new(0)).is_empty());
    }
}
