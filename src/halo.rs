//! The halo exchange protocol. Every partition contributes an array of
//! per-node values (`width` reals per node); nodes on a partition boundary
//! must end up holding the sum of the contributions of every partition that
//! shares them. One exchange of one quantity is a *round*: each partition
//! sends its boundary values to every neighbor once, accumulates what it
//! receives, and is complete when it has its own contribution plus exactly
//! one message from each neighbor in its adjacency map.
//!
//! Rounds are keyed by the quantity being exchanged, and tagged with the mesh
//! generation. Several rounds (of different quantities) may be open at once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::adjacency::AdjacencyMap;
use crate::automaton::{execute, execute_par, Automaton, Status};
use crate::boundary::BoundaryIndex;
use crate::error::{Error, Result, Stage};
use crate::message::{Body, Communicator, Link};
use crate::mesh::{Generation, Partition};




/// Identifies the quantity a round exchanges.
///
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuantityKey {
    Volume,
    Lhs,
    Rhs,
    Named(String),
}

impl QuantityKey {
    pub fn stage(&self) -> Stage {
        match self {
            QuantityKey::Volume => Stage::Volume,
            QuantityKey::Lhs => Stage::Lhs,
            QuantityKey::Rhs => Stage::Rhs,
            QuantityKey::Named(_) => Stage::Setup,
        }
    }
}

impl fmt::Display for QuantityKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityKey::Volume => fmt.write_str("volume"),
            QuantityKey::Lhs => fmt.write_str("lhs"),
            QuantityKey::Rhs => fmt.write_str("rhs"),
            QuantityKey::Named(name) => fmt.write_str(name),
        }
    }
}




/// One partition's boundary values for one neighbor: `width` reals for each
/// node the two share, in ascending global ID order.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HaloMessage {
    pub from: usize,
    pub key: QuantityKey,
    pub generation: Generation,
    pub width: usize,
    pub values: Vec<f64>,
}




/// Where each neighbor's values come from and go to, for one partition and
/// one mesh generation. Shared by all rounds of that generation.
///
#[derive(Clone, Debug)]
pub struct Routing {
    rank: usize,
    generation: Generation,
    nnodes: usize,
    /// Per neighbor, the (local index, slot) of each shared node, ascending
    /// global ID.
    links: BTreeMap<usize, Vec<(usize, usize)>>,
    /// Local index of each boundary slot.
    slot_lid: Vec<usize>,
}

impl Routing {
    pub fn new(partition: &Partition, adjacency: &AdjacencyMap) -> Result<Self> {
        let boundary = BoundaryIndex::build(adjacency);
        let local = |gid: u64| {
            partition.to_local(gid).ok_or_else(|| {
                Error::InvalidMesh(format!("[rank {}] shared node {} is not in the mesh", partition.rank(), gid))
            })
        };

        let slot_lid = boundary.iter().map(|(gid, _)| local(gid)).collect::<Result<Vec<_>>>()?;
        let mut links = BTreeMap::new();

        for p in adjacency.neighbors() {
            let link = adjacency
                .shared_with(p)
                .map(|gid| Ok((local(gid)?, boundary.slot(gid).unwrap_or_default())))
                .collect::<Result<Vec<_>>>()?;
            links.insert(p, link);
        }

        Ok(Self {
            rank: partition.rank(),
            generation: partition.generation(),
            nnodes: partition.num_nodes(),
            links,
            slot_lid,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn num_neighbors(&self) -> usize {
        self.links.len()
    }

    pub fn num_slots(&self) -> usize {
        self.slot_lid.len()
    }
}




/// One partition's participation in one round.
///
pub struct ExchangeRound {
    routing: Arc<Routing>,
    key: QuantityKey,
    width: usize,
    contribution: Option<Vec<f64>>,
    received: BTreeMap<usize, Vec<f64>>,
}

impl ExchangeRound {
    /// Create a round that has not been opened locally yet; messages may
    /// arrive before the local contribution does.
    pub fn new(routing: Arc<Routing>, key: QuantityKey, width: usize) -> Self {
        Self {
            routing,
            key,
            width,
            contribution: None,
            received: BTreeMap::new(),
        }
    }

    /// Create a round with the local contribution in place.
    pub fn opened(routing: Arc<Routing>, key: QuantityKey, width: usize, contribution: Vec<f64>) -> Result<Self> {
        let mut round = Self::new(routing, key, width);
        round.contribute(contribution)?;
        Ok(round)
    }

    fn violation(&self, peer: usize, detail: String) -> Error {
        Error::ProtocolViolation {
            rank: self.routing.rank,
            stage: self.key.stage(),
            peer,
            detail: format!("round {} of {}: {}", self.key, self.routing.generation, detail),
        }
    }

    /// Supply the local contribution, `width` values per local node.
    pub fn contribute(&mut self, contribution: Vec<f64>) -> Result<()> {
        if self.contribution.is_some() {
            return Err(self.violation(self.routing.rank, "round reopened while still open".into()));
        }
        if contribution.len() != self.routing.nnodes * self.width {
            return Err(self.violation(
                self.routing.rank,
                format!(
                    "local contribution has {} values, expected {}",
                    contribution.len(),
                    self.routing.nnodes * self.width
                ),
            ));
        }
        self.contribution = Some(contribution);
        Ok(())
    }

    pub fn key(&self) -> &QuantityKey {
        &self.key
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_open(&self) -> bool {
        self.contribution.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.is_open() && self.received.len() == self.routing.links.len()
    }

    /// Return the outgoing messages: the boundary slice of the local
    /// contribution for every neighbor. Empty until the round is opened.
    pub fn outgoing(&self) -> Vec<(usize, HaloMessage)> {
        let w = self.width;
        let contribution = match &self.contribution {
            Some(c) => c,
            None => return Vec::new(),
        };

        self.routing
            .links
            .iter()
            .map(|(&p, link)| {
                let values = link
                    .iter()
                    .flat_map(|&(lid, _)| contribution[lid * w..(lid + 1) * w].iter().copied())
                    .collect();
                let message = HaloMessage {
                    from: self.routing.rank,
                    key: self.key.clone(),
                    generation: self.routing.generation,
                    width: w,
                    values,
                };
                (p, message)
            })
            .collect()
    }

    /// Accept one neighbor's message. Every neighbor sends exactly once per
    /// round; anything else is a protocol violation.
    pub fn accept(&mut self, message: HaloMessage) -> Result<Status> {
        let from = message.from;

        if message.generation != self.routing.generation {
            return Err(self.violation(from, format!("message is from {}", message.generation)));
        }
        if message.key != self.key {
            return Err(self.violation(from, format!("message belongs to round {}", message.key)));
        }
        let link = match self.routing.links.get(&from) {
            Some(link) => link,
            None => return Err(self.violation(from, "sender is not a neighbor".into())),
        };
        if self.received.contains_key(&from) {
            return Err(self.violation(from, "duplicate message".into()));
        }
        if message.width != self.width || message.values.len() != link.len() * self.width {
            return Err(self.violation(
                from,
                format!(
                    "payload of {} values with width {}, expected {} with width {}",
                    message.values.len(),
                    message.width,
                    link.len() * self.width,
                    self.width
                ),
            ));
        }
        debug!("[rank {}] round {}: {} values from rank {}", self.routing.rank, self.key, message.values.len(), from);

        self.received.insert(from, message.values);
        Ok(Status::eligible_if(self.is_complete()))
    }

    /// Return the merged array: the local contribution, with every boundary
    /// node replaced by the sum over all partitions sharing it. The sum is
    /// formed in ascending rank order, so it does not depend on the arrival
    /// order and is bit-identical on every partition holding the node.
    pub fn merge(self) -> Vec<f64> {
        let w = self.width;
        let routing = self.routing;
        let mut merged = self
            .contribution
            .unwrap_or_else(|| vec![0.0; routing.nnodes * w]);
        let mut accum = vec![0.0; routing.slot_lid.len() * w];
        let mut own_added = false;

        let add_own = |accum: &mut Vec<f64>, merged: &Vec<f64>| {
            for (slot, &lid) in routing.slot_lid.iter().enumerate() {
                for c in 0..w {
                    accum[slot * w + c] += merged[lid * w + c];
                }
            }
        };

        for (p, values) in &self.received {
            if !own_added && *p > routing.rank {
                add_own(&mut accum, &merged);
                own_added = true;
            }
            for (&(_, slot), chunk) in routing.links[p].iter().zip(values.chunks(w.max(1))) {
                for c in 0..w {
                    accum[slot * w + c] += chunk[c];
                }
            }
        }
        if !own_added {
            add_own(&mut accum, &merged);
        }

        for (slot, &lid) in routing.slot_lid.iter().enumerate() {
            merged[lid * w..(lid + 1) * w].copy_from_slice(&accum[slot * w..(slot + 1) * w]);
        }
        merged
    }
}

impl Automaton for ExchangeRound {
    type Key = usize;
    type Message = HaloMessage;
    type Value = (usize, Vec<f64>);

    fn key(&self) -> usize {
        self.routing.rank
    }

    fn messages(&self) -> Vec<(usize, HaloMessage)> {
        self.outgoing()
    }

    fn receive(&mut self, message: HaloMessage) -> Result<Status> {
        self.accept(message)
    }

    fn is_independent(&self) -> bool {
        self.routing.links.is_empty() && self.is_open()
    }

    fn value(self) -> (usize, Vec<f64>) {
        (self.routing.rank, self.merge())
    }
}




/// The table of rounds of one partition, keyed by quantity.
///
pub struct HaloExchange {
    routing: Arc<Routing>,
    rounds: HashMap<QuantityKey, ExchangeRound>,
}

impl HaloExchange {
    pub fn new(partition: &Partition, adjacency: &AdjacencyMap) -> Result<Self> {
        Ok(Self {
            routing: Arc::new(Routing::new(partition, adjacency)?),
            rounds: HashMap::new(),
        })
    }

    /// Switch to a new mesh generation after a topology change. Rounds of
    /// the old generation are discarded.
    pub fn rebuild(&mut self, partition: &Partition, adjacency: &AdjacencyMap) -> Result<()> {
        for key in self.rounds.keys() {
            warn!("[rank {}] discarding round {} of {}", self.routing.rank, key, self.routing.generation);
        }
        self.routing = Arc::new(Routing::new(partition, adjacency)?);
        self.rounds.clear();
        Ok(())
    }

    pub fn generation(&self) -> Generation {
        self.routing.generation
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// Open a round with the local contribution and return the messages to
    /// send. Messages that arrived before this call are already counted.
    pub fn open(&mut self, key: QuantityKey, width: usize, contribution: Vec<f64>) -> Result<Vec<(usize, HaloMessage)>> {
        if let Some(round) = self.rounds.get_mut(&key) {
            if round.width != width && !round.is_open() {
                return Err(round.violation(
                    self.routing.rank,
                    format!("opened with width {} but messages had width {}", width, round.width),
                ));
            }
            round.contribute(contribution)?;
            return Ok(round.outgoing());
        }
        let round = ExchangeRound::opened(self.routing.clone(), key.clone(), width, contribution)?;
        let outgoing = round.outgoing();
        self.rounds.insert(key, round);
        Ok(outgoing)
    }

    /// Deliver a message. Messages from another generation are dropped
    /// with a warning; a valid message for a round that is not open yet
    /// creates it.
    pub fn receive(&mut self, message: HaloMessage) -> Result<Status> {
        if message.generation != self.routing.generation {
            warn!(
                "[rank {}] dropping {} message from rank {} ({}, now {})",
                self.routing.rank, message.key, message.from, message.generation, self.routing.generation
            );
            return Ok(Status::Ineligible);
        }
        if let Some(round) = self.rounds.get_mut(&message.key) {
            return round.accept(message);
        }
        let key = message.key.clone();
        let mut round = ExchangeRound::new(self.routing.clone(), key.clone(), message.width);
        let status = round.accept(message)?;
        self.rounds.insert(key, round);
        Ok(status)
    }

    pub fn is_open(&self, key: &QuantityKey) -> bool {
        self.rounds.get(key).map_or(false, ExchangeRound::is_open)
    }

    pub fn is_complete(&self, key: &QuantityKey) -> bool {
        self.rounds.get(key).map_or(false, ExchangeRound::is_complete)
    }

    /// Close a complete round and return the merged array.
    pub fn finish(&mut self, key: &QuantityKey) -> Result<Vec<f64>> {
        match self.rounds.remove(key) {
            Some(round) if round.is_complete() => Ok(round.merge()),
            Some(round) => {
                let error = round.violation(self.routing.rank, "finished before complete".into());
                self.rounds.insert(key.clone(), round);
                Err(error)
            }
            None => Err(Error::ProtocolViolation {
                rank: self.routing.rank,
                stage: key.stage(),
                peer: self.routing.rank,
                detail: format!("round {} was never opened", key),
            }),
        }
    }
}




/// Run one round for a group of partitions living in this process, through
/// the automaton executor. `parts[p]` and `contributions[p]` belong to rank
/// `p`; the merged arrays are returned in the same order.
///
pub fn exchange_group(
    parts: &[(Partition, AdjacencyMap)],
    key: QuantityKey,
    width: usize,
    contributions: Vec<Vec<f64>>,
) -> Result<Vec<Vec<f64>>> {
    let rounds = parts
        .iter()
        .zip(contributions)
        .map(|((partition, adjacency), contribution)| {
            let routing = Arc::new(Routing::new(partition, adjacency)?);
            ExchangeRound::opened(routing, key.clone(), width, contribution)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut merged: Vec<(usize, Vec<f64>)> = if rayon::current_num_threads() >= 2 {
        rayon::scope(|scope| execute_par(scope, rounds).map(Iterator::collect))?
    } else {
        execute(rounds)?.collect()
    };
    merged.sort_by_key(|(rank, _)| *rank);
    Ok(merged.into_iter().map(|(_, values)| values).collect())
}




/// Run rounds for one partition over its link: open every round, then
/// deliver halo messages until all of them are complete. The rounds are
/// pipelined; a message for any of them is taken in whatever order it
/// arrives. Returns the merged arrays in the order the rounds were given.
///
pub fn exchange<C: Communicator>(
    link: &mut Link<C>,
    halo: &mut HaloExchange,
    rounds: Vec<(QuantityKey, usize, Vec<f64>)>,
) -> Result<Vec<Vec<f64>>> {
    let keys: Vec<QuantityKey> = rounds.iter().map(|(key, _, _)| key.clone()).collect();

    for (key, width, contribution) in rounds {
        for (to, message) in halo.open(key, width, contribution)? {
            link.post(to, Body::Halo(message))?;
        }
    }

    while !keys.iter().all(|key| halo.is_complete(key)) {
        let envelope = link.next(|e| matches!(&e.body, Body::Halo(m) if keys.contains(&m.key)))?;

        if let Body::Halo(message) = envelope.body {
            if message.from != envelope.from {
                return Err(Error::ProtocolViolation {
                    rank: link.rank(),
                    stage: message.key.stage(),
                    peer: envelope.from,
                    detail: format!("halo message claims to come from rank {}", message.from),
                });
            }
            halo.receive(message)?;
        }
    }
    keys.iter().map(|key| halo.finish(key)).collect()
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::mesh::{distribute, GlobalMesh};

    fn slabs(n: usize, nparts: usize) -> Vec<(Partition, AdjacencyMap)> {
        let mesh = GlobalMesh::cube(n);
        distribute(&mesh, &mesh.slabs(nparts), nparts).unwrap()
    }

    fn ones(parts: &[(Partition, AdjacencyMap)]) -> Vec<Vec<f64>> {
        parts.iter().map(|(p, _)| vec![1.0; p.num_nodes()]).collect()
    }

    #[test]
    fn merged_values_count_the_sharing_partitions() {
        let parts = slabs(3, 3);
        let merged = exchange_group(&parts, QuantityKey::Named("count".into()), 1, ones(&parts)).unwrap();

        for ((partition, adjacency), values) in parts.iter().zip(&merged) {
            for (lid, &gid) in partition.gid().iter().enumerate() {
                let expected = 1 + adjacency.neighbors_of_node(gid).count();
                assert_eq!(values[lid], expected as f64);
            }
        }
    }

    #[test]
    fn merged_nodal_volumes_agree_on_shared_nodes() {
        let parts = slabs(3, 3);
        let volumes = parts.iter().map(|(p, _)| p.nodal_volumes().unwrap()).collect();
        let merged = exchange_group(&parts, QuantityKey::Volume, 1, volumes).unwrap();

        for gid in parts[1].1.shared_with(0) {
            let v0 = merged[0][parts[0].0.to_local(gid).unwrap()];
            let v1 = merged[1][parts[1].0.to_local(gid).unwrap()];
            assert_eq!(v0, v1);
        }
    }

    #[test]
    fn empty_adjacency_completes_immediately() {
        let parts = slabs(2, 1);
        let mut halo = HaloExchange::new(&parts[0].0, &parts[0].1).unwrap();
        let outgoing = halo.open(QuantityKey::Lhs, 2, vec![0.5; 2 * parts[0].0.num_nodes()]).unwrap();

        assert!(outgoing.is_empty());
        assert!(halo.is_complete(&QuantityKey::Lhs));
        assert_eq!(halo.finish(&QuantityKey::Lhs).unwrap(), vec![0.5; 2 * parts[0].0.num_nodes()]);
    }

    fn two_halos() -> (Vec<(Partition, AdjacencyMap)>, HaloExchange, HaloExchange) {
        let parts = slabs(2, 2);
        let h0 = HaloExchange::new(&parts[0].0, &parts[0].1).unwrap();
        let h1 = HaloExchange::new(&parts[1].0, &parts[1].1).unwrap();
        (parts, h0, h1)
    }

    #[test]
    fn messages_before_open_are_counted() {
        let (parts, mut h0, mut h1) = two_halos();
        let outgoing = h1.open(QuantityKey::Rhs, 1, vec![2.0; parts[1].0.num_nodes()]).unwrap();
        assert_eq!(outgoing.len(), 1);

        for (_, message) in outgoing {
            assert_eq!(h0.receive(message).unwrap(), Status::Ineligible);
        }
        assert!(!h0.is_complete(&QuantityKey::Rhs));
        h0.open(QuantityKey::Rhs, 1, vec![1.0; parts[0].0.num_nodes()]).unwrap();
        assert!(h0.is_complete(&QuantityKey::Rhs));

        let merged = h0.finish(&QuantityKey::Rhs).unwrap();
        for (lid, &gid) in parts[0].0.gid().iter().enumerate() {
            let expected = if parts[0].1.is_shared(gid) { 3.0 } else { 1.0 };
            assert_eq!(merged[lid], expected);
        }
    }

    #[test]
    fn duplicate_messages_are_violations() {
        let (parts, mut h0, mut h1) = two_halos();
        let outgoing = h1.open(QuantityKey::Rhs, 1, vec![2.0; parts[1].0.num_nodes()]).unwrap();
        let message = outgoing[0].1.clone();

        h0.receive(message.clone()).unwrap();
        assert!(matches!(h0.receive(message), Err(Error::ProtocolViolation { peer: 1, .. })));
    }

    #[test]
    fn reopening_is_a_violation() {
        let (parts, mut h0, _) = two_halos();
        let n = parts[0].0.num_nodes();
        h0.open(QuantityKey::Lhs, 1, vec![0.0; n]).unwrap();
        assert!(matches!(
            h0.open(QuantityKey::Lhs, 1, vec![0.0; n]),
            Err(Error::ProtocolViolation { stage: Stage::Lhs, .. })
        ));
    }

    #[test]
    fn wrong_payload_length_is_a_violation() {
        let (parts, mut h0, mut h1) = two_halos();
        let mut message = h1.open(QuantityKey::Rhs, 1, vec![2.0; parts[1].0.num_nodes()]).unwrap()[0].1.clone();
        message.values.pop();
        assert!(h0.receive(message).is_err());
    }

    #[test]
    fn non_neighbors_are_rejected() {
        let (_, mut h0, _) = two_halos();
        let message = HaloMessage {
            from: 5,
            key: QuantityKey::Rhs,
            generation: Generation::default(),
            width: 1,
            values: vec![],
        };
        assert!(matches!(h0.receive(message), Err(Error::ProtocolViolation { peer: 5, .. })));
    }

    #[test]
    fn stale_messages_are_dropped() {
        let (parts, mut h0, mut h1) = two_halos();
        let message = h1.open(QuantityKey::Rhs, 1, vec![2.0; parts[1].0.num_nodes()]).unwrap()[0].1.clone();
        let mut partition = parts[0].0.clone();
        partition.advance_generation();
        h0.rebuild(&partition, &parts[0].1).unwrap();

        assert_eq!(h0.receive(message).unwrap(), Status::Ineligible);
        assert!(!h0.is_open(&QuantityKey::Rhs));
    }

    #[test]
    fn messages_from_a_newer_generation_are_dropped() {
        let (parts, mut h0, _) = two_halos();
        let mut partition = parts[1].0.clone();
        partition.advance_generation();
        let mut h1 = HaloExchange::new(&partition, &parts[1].1).unwrap();
        let message = h1.open(QuantityKey::Rhs, 1, vec![2.0; partition.num_nodes()]).unwrap()[0].1.clone();

        assert_eq!(h0.receive(message).unwrap(), Status::Ineligible);
        assert!(!h0.is_open(&QuantityKey::Rhs));
        assert!(!h0.is_complete(&QuantityKey::Rhs));
    }

    #[test]
    fn rejected_message_leaves_no_round_behind() {
        let (parts, mut h0, mut h1) = two_halos();
        let message = h1.open(QuantityKey::Rhs, 1, vec![2.0; parts[1].0.num_nodes()]).unwrap()[0].1.clone();
        let mut wide = message.clone();
        wide.width = 2;

        assert!(h0.receive(wide).is_err());
        h0.receive(message).unwrap();
        h0.open(QuantityKey::Rhs, 1, vec![1.0; parts[0].0.num_nodes()]).unwrap();
        assert!(h0.is_complete(&QuantityKey::Rhs));
    }

    #[test]
    fn finishing_early_is_a_violation() {
        let (parts, mut h0, _) = two_halos();
        h0.open(QuantityKey::Lhs, 1, vec![0.0; parts[0].0.num_nodes()]).unwrap();
        assert!(h0.finish(&QuantityKey::Lhs).is_err());
        assert!(h0.is_open(&QuantityKey::Lhs));
    }
}
