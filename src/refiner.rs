//! The refiner coordinator: makes the local decisions of the refinement
//! engine agree across partition boundaries.
//!
//! A refinement pass goes `Idle -> LocalMark -> LocalApply ->
//! ExchangeBoundaryEdges -> Evaluate`, and then either `Done` when no
//! partition had to change anything, or `Correct -> ExchangeBoundaryEdges`
//! for another round. Each partition first marks edges with its criterion and
//! closes the marks under the refinement templates. Partitions then exchange
//! the states of the marked edges they share; an edge that a neighbor splits
//! but this partition does not is locked (split here too), the templates are
//! closed again, and the number of such edges is summed over all partitions.
//! The higher refinement level always wins, so refinement only ever spreads
//! and the rounds terminate. Once a round changes nothing anywhere, every
//! partition applies its marks, the new nodes get global IDs, and the
//! generation moves on.
//!
//! Derefinement works the other way around: a split edge is un-split only if
//! every partition sharing it proposes to, so the agreed set can only shrink.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};

use crate::adjacency::AdjacencyMap;
use crate::amr::{self, Criterion, Edge, EdgeState, Family};
use crate::config::{CriterionKind, RefineConfig};
use crate::error::{Disagreement, Error, Result, Stage};
use crate::message::{Body, Communicator, Envelope, Link};
use crate::mesh::Partition;
use crate::scheme::MeshChange;




/// Where a partition is within a refinement or derefinement pass.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassState {
    Idle,
    LocalMark,
    LocalApply,
    ExchangeBoundaryEdges,
    Evaluate,
    Correct,
    Done,
}




/// Per-partition coordinator state.
///
pub struct Refiner {
    rank: usize,
    config: RefineConfig,
    state: PassState,
    boundary: BTreeMap<Edge<u64>, EdgeState>,
    rounds: usize,
}

impl Refiner {
    pub fn new(rank: usize, config: &RefineConfig) -> Self {
        Self {
            rank,
            config: config.clone(),
            state: PassState::Idle,
            boundary: BTreeMap::new(),
            rounds: 0,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    /// The final state of every edge shared with another partition, as of
    /// the last refinement pass.
    pub fn boundary_states(&self) -> &BTreeMap<Edge<u64>, EdgeState> {
        &self.boundary
    }

    /// Number of exchange rounds the last pass needed.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    fn enter(&mut self, state: PassState) {
        debug!("[rank {}] refiner {:?} -> {:?}", self.rank, self.state, state);
        self.state = state;
    }

    fn violation(&self, stage: Stage, peer: usize, detail: String) -> Error {
        Error::ProtocolViolation {
            rank: self.rank,
            stage,
            peer,
            detail,
        }
    }

    /// Resolve a configured criterion kind for this partition. The error
    /// indicator needs a node field; the edge list is given in global IDs and
    /// edges this partition does not hold are skipped.
    ///
    pub fn criterion(&self, kind: CriterionKind, partition: &Partition, indicator: Option<&[f64]>) -> Result<Criterion> {
        match kind {
            CriterionKind::Uniform => Ok(Criterion::Uniform),
            CriterionKind::ErrorIndicator => match indicator {
                Some(field) => Ok(Criterion::ErrorIndicator {
                    field: field.to_vec(),
                    threshold: self.config.threshold,
                }),
                None => Err(Error::Config("error-based refinement needs a solution field".into())),
            },
            CriterionKind::EdgeList => Ok(Criterion::EdgeList(
                self.config
                    .edges
                    .iter()
                    .filter_map(|&(a, b)| partition.local_edge(&Edge::new(a, b)))
                    .collect(),
            )),
            CriterionKind::Region => match self.config.region {
                Some((lower, upper)) => Ok(Criterion::Region { lower, upper }),
                None => Err(Error::Config("region refinement needs refine_region".into())),
            },
        }
    }

    /// The derefinement criterion, if derefinement is configured.
    ///
    pub fn deref_criterion(&self, indicator: &[f64]) -> Option<Criterion> {
        self.config.deref_threshold.map(|threshold| Criterion::ErrorIndicator {
            field: indicator.to_vec(),
            threshold,
        })
    }

    fn check_sender(
        &self,
        stage: Stage,
        envelope: &Envelope,
        expected: &BTreeSet<usize>,
        heard: &mut BTreeSet<usize>,
    ) -> Result<()> {
        if !expected.contains(&envelope.from) {
            return Err(self.violation(stage, envelope.from, format!("unexpected {} message", envelope.body.kind())));
        }
        if !heard.insert(envelope.from) {
            return Err(self.violation(stage, envelope.from, format!("duplicate {} message", envelope.body.kind())));
        }
        Ok(())
    }

    /// Find out which of the local edges are shared with which neighbors.
    /// Holding both end points of an edge does not mean holding the edge, so
    /// each partition sends every node neighbor its candidate edges, and
    /// keeps the ones it also holds from what it receives.
    ///
    fn handshake<C: Communicator>(
        &self,
        link: &mut Link<C>,
        adjacency: &AdjacencyMap,
        local: &BTreeSet<Edge<u64>>,
    ) -> Result<BTreeMap<Edge<u64>, BTreeSet<usize>>> {
        let neighbors: BTreeSet<usize> = adjacency.neighbors().collect();
        let mut candidates: BTreeMap<usize, Vec<Edge<u64>>> = neighbors.iter().map(|&p| (p, Vec::new())).collect();

        for e in local {
            let (a, b) = e.nodes();
            for p in adjacency.shares_edge_candidates(a, b) {
                candidates.entry(p).or_default().push(*e);
            }
        }
        for (p, edges) in candidates {
            link.post(p, Body::BoundaryEdges(edges))?;
        }

        let mut sharers: BTreeMap<Edge<u64>, BTreeSet<usize>> = BTreeMap::new();
        let mut heard = BTreeSet::new();

        while heard.len() < neighbors.len() {
            let envelope = link.next(|e| matches!(e.body, Body::BoundaryEdges(_)))?;
            self.check_sender(Stage::Refine, &envelope, &neighbors, &mut heard)?;

            if let Body::BoundaryEdges(edges) = envelope.body {
                for e in edges.into_iter().filter(|e| local.contains(e)) {
                    sharers.entry(e).or_default().insert(envelope.from);
                }
            }
        }
        Ok(sharers)
    }

    /// Run one refinement pass. Returns the change if the mesh changed
    /// anywhere; when no partition marks anything, nothing is touched and
    /// the generation stays the same.
    ///
    pub fn refine<C: Communicator>(
        &mut self,
        link: &mut Link<C>,
        partition: &mut Partition,
        adjacency: &mut AdjacencyMap,
        criterion: &Criterion,
    ) -> Result<Option<MeshChange>> {
        let rank = self.rank;

        self.enter(PassState::LocalMark);
        let mut marked = amr::mark_edges(partition.inpoel(), partition.coord(), criterion)?;

        self.enter(PassState::LocalApply);
        amr::conform(partition.inpoel(), &mut marked);

        if link.sum_u64(marked.len() as u64)? == 0 {
            debug!("[rank {}] no edges marked on any partition", rank);
            self.rounds = 0;
            self.enter(PassState::Idle);
            return Ok(None);
        }

        let local: BTreeSet<Edge<u64>> = partition.edges().iter().map(|e| partition.global_edge(e)).collect();
        let sharers = self.handshake(link, adjacency, &local)?;
        let mut by_neighbor: BTreeMap<usize, Vec<Edge<u64>>> = BTreeMap::new();

        for (e, ranks) in &sharers {
            for &p in ranks {
                by_neighbor.entry(p).or_default().push(*e);
            }
        }
        let edge_neighbors: BTreeSet<usize> = by_neighbor.keys().copied().collect();

        let mut states: BTreeMap<Edge<u64>, EdgeState> = marked
            .iter()
            .map(|e| (partition.global_edge(e), EdgeState::Refined))
            .collect();
        let mut round = 0;

        loop {
            self.enter(PassState::ExchangeBoundaryEdges);

            for (&p, edges) in &by_neighbor {
                let outgoing = edges
                    .iter()
                    .filter_map(|e| states.get(e).map(|s| (*e, *s)))
                    .collect();
                link.post(p, Body::EdgeStates { round, states: outgoing })?;
            }

            let mut heard = BTreeSet::new();
            let mut incoming = Vec::new();

            while heard.len() < edge_neighbors.len() {
                let envelope = link.next(|e| matches!(e.body, Body::EdgeStates { .. }))?;
                self.check_sender(Stage::Refine, &envelope, &edge_neighbors, &mut heard)?;
                let from = envelope.from;

                if let Body::EdgeStates { round: r, states: theirs } = envelope.body {
                    if r != round {
                        return Err(self.violation(
                            Stage::Refine,
                            from,
                            format!("edge states for correction round {} during round {}", r, round),
                        ));
                    }
                    for (e, s) in theirs {
                        if !sharers.get(&e).map_or(false, |ranks| ranks.contains(&from)) {
                            let (a, b) = e.nodes();
                            return Err(self.violation(Stage::Refine, from, format!("edge {}-{} is not shared", a, b)));
                        }
                        incoming.push((e, s, from));
                    }
                }
            }

            self.enter(PassState::Evaluate);
            let mut locked = Vec::new();

            for (e, theirs, from) in incoming {
                let mine = states.get(&e).copied().unwrap_or(EdgeState::Unrefined);

                if theirs.is_split() && !mine.is_split() {
                    states.insert(e, mine.merge(EdgeState::Locked));
                    locked.push((e, from));
                }
            }

            if !locked.is_empty() {
                self.enter(PassState::Correct);

                for (e, _) in &locked {
                    if let Some(local) = partition.local_edge(e) {
                        marked.insert(local);
                    }
                }
                for e in amr::conform(partition.inpoel(), &mut marked) {
                    states.entry(partition.global_edge(&e)).or_insert(EdgeState::Refined);
                }
            }

            let extra = link.sum_u64(locked.len() as u64)?;
            round += 1;

            if extra == 0 {
                break;
            }
            debug!("[rank {}] correction round {}: {} edges locked globally", rank, round, extra);

            if round >= self.config.max_correction_rounds {
                let edges = locked
                    .iter()
                    .map(|(e, from)| Disagreement {
                        edge: e.nodes(),
                        partitions: vec![rank.min(*from), rank.max(*from)],
                    })
                    .collect();
                return Err(Error::RefinementDiverged { rank, rounds: round, edges });
            }
        }

        self.enter(PassState::Done);
        self.rounds = round;

        let refinement = amr::apply_refinement(partition.inpoel(), partition.coord(), &marked)?;
        let added: Vec<(usize, Edge<u64>)> = refinement
            .added_nodes
            .iter()
            .map(|(&n, e)| (n, partition.global_edge(e)))
            .collect();

        let owner = |e: &Edge<u64>| {
            sharers
                .get(e)
                .and_then(|ranks| ranks.iter().next().copied())
                .map_or(rank, |p| p.min(rank))
        };
        let mut owned: Vec<Edge<u64>> = added.iter().map(|(_, e)| *e).filter(|e| owner(e) == rank).collect();
        owned.sort();

        let counts = link.gather_u64(owned.len() as u64)?;
        let first = partition.next_gid() + counts[..rank].iter().sum::<u64>();
        let next_gid = partition.next_gid() + counts.iter().sum::<u64>();
        let mut new_gid: BTreeMap<Edge<u64>, u64> = owned.iter().zip(first..).map(|(e, g)| (*e, g)).collect();

        for (&p, edges) in &by_neighbor {
            let ids = edges
                .iter()
                .filter_map(|e| new_gid.get(e).map(|g| (*e, *g)))
                .collect();
            link.post(p, Body::NodeIds(ids))?;
        }

        let mut heard = BTreeSet::new();

        while heard.len() < edge_neighbors.len() {
            let envelope = link.next(|e| matches!(e.body, Body::NodeIds(_)))?;
            self.check_sender(Stage::Refine, &envelope, &edge_neighbors, &mut heard)?;
            let from = envelope.from;

            if let Body::NodeIds(ids) = envelope.body {
                for (e, g) in ids {
                    if owner(&e) != from || !states.get(&e).map_or(false, |s| s.is_split()) {
                        let (a, b) = e.nodes();
                        return Err(self.violation(
                            Stage::Refine,
                            from,
                            format!("node ID {} for edge {}-{} which the sender does not own", g, a, b),
                        ));
                    }
                    new_gid.insert(e, g);
                }
            }
        }

        let mut gid = partition.gid().to_vec();
        let mut added_shared: BTreeMap<usize, BTreeSet<u64>> = BTreeMap::new();

        for (n, e) in &added {
            let g = match new_gid.get(e) {
                Some(&g) if *n == gid.len() => g,
                _ => {
                    let (a, b) = e.nodes();
                    return Err(self.violation(Stage::Refine, owner(e), format!("no node ID for the midpoint of {}-{}", a, b)));
                }
            };
            gid.push(g);

            for &p in sharers.get(e).into_iter().flatten() {
                added_shared.entry(p).or_default().insert(g);
            }
        }

        let to_gid = |l: usize| gid.get(l).copied().ok_or(l);
        let mut history = partition.history().to_vec();

        for family in &refinement.families {
            let family = family
                .try_map(to_gid)
                .map_err(|l| Error::InvalidMesh(format!("[rank {}] family references unknown node {}", rank, l)))?;
            history.push(family);
        }

        let old_nodes = partition.num_nodes();
        let nelem = refinement.inpoel.len();
        let added_node_parents = refinement
            .added_nodes
            .iter()
            .map(|(&n, e)| (n, e.nodes()))
            .collect();

        partition.replace(refinement.inpoel, refinement.coord, gid, history, next_gid)?;
        partition.advance_generation();
        *adjacency = adjacency.rebuilt(&BTreeSet::new(), &added_shared);
        link.advance(partition.generation());

        self.boundary = sharers
            .keys()
            .map(|e| (*e, states.get(e).copied().unwrap_or(EdgeState::Unrefined)))
            .collect();

        info!(
            "[rank {}] refined to {}: {} new nodes, {} elements, {} exchange rounds",
            rank,
            partition.generation(),
            added.len(),
            nelem,
            round
        );
        self.enter(PassState::Idle);

        Ok(Some(MeshChange {
            generation: partition.generation(),
            connectivity: partition.inpoel().to_vec(),
            coordinates: partition.coord().to_vec(),
            added_node_parents,
            node_map: (0..old_nodes).map(Some).collect(),
            adjacency: adjacency.clone(),
        }))
    }

    /// Run one derefinement pass. Returns the change if any split edge was
    /// un-split anywhere.
    ///
    pub fn derefine<C: Communicator>(
        &mut self,
        link: &mut Link<C>,
        partition: &mut Partition,
        adjacency: &mut AdjacencyMap,
        criterion: &Criterion,
    ) -> Result<Option<MeshChange>> {
        let rank = self.rank;

        self.enter(PassState::LocalMark);
        let mut index = Vec::new();
        let mut families: Vec<Family> = Vec::new();

        for (i, family) in partition.history().iter().enumerate() {
            if let Ok(local) = family.try_map(|g| partition.to_local(g).ok_or(())) {
                index.push(i);
                families.push(local);
            }
        }
        let candidates = amr::derefinement_candidates(&families, partition.coord(), criterion)?;

        self.enter(PassState::LocalApply);
        let mut unsplit = amr::deref_closure(partition.inpoel(), &families, &candidates);

        if link.sum_u64(unsplit.len() as u64)? == 0 {
            self.enter(PassState::Idle);
            return Ok(None);
        }

        let midpoint: BTreeMap<Edge<u64>, u64> = families
            .iter()
            .flat_map(|f| f.splits.iter())
            .map(|(e, m)| (partition.global_edge(e), partition.gid()[*m]))
            .collect();
        let sharers_of = |e: &Edge<u64>| -> Vec<usize> {
            midpoint
                .get(e)
                .map(|&m| adjacency.neighbors_of_node(m).collect())
                .unwrap_or_default()
        };
        let neighbors: BTreeSet<usize> = adjacency.neighbors().collect();
        let mut round = 0;

        loop {
            self.enter(PassState::ExchangeBoundaryEdges);
            let proposed: Vec<Edge<u64>> = unsplit.iter().map(|e| partition.global_edge(e)).collect();

            for &p in &neighbors {
                let edges = proposed.iter().filter(|e| sharers_of(*e).contains(&p)).copied().collect();
                link.post(p, Body::Unsplit { round, edges })?;
            }

            let mut heard = BTreeSet::new();
            let mut theirs: HashMap<usize, BTreeSet<Edge<u64>>> = HashMap::new();

            while heard.len() < neighbors.len() {
                let envelope = link.next(|e| matches!(e.body, Body::Unsplit { .. }))?;
                self.check_sender(Stage::Derefine, &envelope, &neighbors, &mut heard)?;

                if let Body::Unsplit { round: r, edges } = envelope.body {
                    if r != round {
                        return Err(self.violation(
                            Stage::Derefine,
                            envelope.from,
                            format!("unsplit proposal for round {} during round {}", r, round),
                        ));
                    }
                    theirs.insert(envelope.from, edges.into_iter().collect());
                }
            }

            self.enter(PassState::Evaluate);
            let mut dropped = Vec::new();

            unsplit.retain(|e| {
                let g = partition.global_edge(e);
                let refusing: Vec<usize> = sharers_of(&g)
                    .into_iter()
                    .filter(|p| !theirs.get(p).map_or(false, |edges| edges.contains(&g)))
                    .collect();

                if refusing.is_empty() {
                    return true;
                }
                let mut partitions = refusing;
                partitions.push(rank);
                partitions.sort_unstable();
                dropped.push(Disagreement {
                    edge: g.nodes(),
                    partitions,
                });
                false
            });
            let closed = amr::deref_closure(partition.inpoel(), &families, &unsplit);

            for e in unsplit.difference(&closed) {
                dropped.push(Disagreement {
                    edge: partition.global_edge(e).nodes(),
                    partitions: vec![rank],
                });
            }
            unsplit = closed;
            round += 1;

            if link.sum_u64(dropped.len() as u64)? == 0 {
                break;
            }
            if round >= self.config.max_correction_rounds {
                return Err(Error::RefinementDiverged {
                    rank,
                    rounds: round,
                    edges: dropped,
                });
            }
            self.enter(PassState::Correct);
        }

        self.enter(PassState::Done);
        self.rounds = round;

        if link.sum_u64(unsplit.len() as u64)? == 0 {
            self.enter(PassState::Idle);
            return Ok(None);
        }

        let derefinement = amr::apply_derefinement(partition.inpoel(), partition.coord(), &families, &unsplit)?;
        let removed: BTreeSet<u64> = derefinement.removed_nodes.iter().map(|&n| partition.gid()[n]).collect();
        let gid: Vec<u64> = partition
            .gid()
            .iter()
            .zip(&derefinement.node_map)
            .filter(|(_, new)| new.is_some())
            .map(|(g, _)| *g)
            .collect();

        let restored: BTreeSet<usize> = derefinement.restored.iter().map(|&k| index[k]).collect();
        let history = partition
            .history()
            .iter()
            .enumerate()
            .filter(|(i, _)| !restored.contains(i))
            .map(|(_, f)| f.clone())
            .collect();

        let next_gid = partition.next_gid();
        let nremoved = removed.len();

        partition.replace(derefinement.inpoel, derefinement.coord, gid, history, next_gid)?;
        partition.advance_generation();
        *adjacency = adjacency.rebuilt(&removed, &BTreeMap::new());
        link.advance(partition.generation());

        info!(
            "[rank {}] derefined to {}: {} nodes removed, {} elements",
            rank,
            partition.generation(),
            nremoved,
            partition.num_elements()
        );
        self.enter(PassState::Idle);

        Ok(Some(MeshChange {
            generation: partition.generation(),
            connectivity: partition.inpoel().to_vec(),
            coordinates: partition.coord().to_vec(),
            added_node_parents: BTreeMap::new(),
            node_map: derefinement.node_map,
            adjacency: adjacency.clone(),
        }))
    }
}




/// The refinement level of every element: how many refinement passes
/// produced it, as a real per element for field output.
///
pub fn refinement_fields(partition: &Partition) -> Vec<f64> {
    let sorted = |mut t: [u64; 4]| {
        t.sort_unstable();
        t
    };
    let parent: HashMap<[u64; 4], [u64; 4]> = partition
        .history()
        .iter()
        .flat_map(|f| f.children.iter().map(move |c| (sorted(*c), sorted(f.parent))))
        .collect();

    (0..partition.num_elements())
        .map(|e| {
            let mut t = sorted(partition.global_element(e));
            let mut level = 0;

            while let Some(p) = parent.get(&t) {
                level += 1;
                t = *p;
            }
            level as f64
        })
        .collect()
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::message::{ChannelComm, ChannelHost};
    use crate::mesh::{distribute, Generation, GlobalMesh};

    type Outcome = Result<(Partition, AdjacencyMap, Option<MeshChange>, BTreeMap<Edge<u64>, EdgeState>)>;

    fn slabs(n: usize, nparts: usize) -> Vec<(Partition, AdjacencyMap)> {
        let mesh = GlobalMesh::cube(n);
        distribute(&mesh, &mesh.slabs(nparts), nparts).unwrap()
    }

    fn run<F>(parts: Vec<(Partition, AdjacencyMap)>, config: &RefineConfig, pass: F) -> Vec<Outcome>
    where
        F: Fn(&mut Refiner, &mut Link<ChannelComm>, &mut Partition, &mut AdjacencyMap) -> Result<Option<MeshChange>> + Sync,
    {
        let host = ChannelHost::new();
        let collective = host.plane(parts.len());
        let data = host.plane(parts.len());
        let pass = &pass;

        std::thread::scope(|scope| {
            let handles: Vec<_> = parts
                .into_iter()
                .zip(collective.into_iter().zip(data))
                .map(|((mut partition, mut adjacency), (c, d))| {
                    scope.spawn(move || {
                        let mut link = Link::new(c, d, partition.generation());
                        let mut refiner = Refiner::new(partition.rank(), config);
                        let change = pass(&mut refiner, &mut link, &mut partition, &mut adjacency)?;
                        Ok((partition, adjacency, change, refiner.boundary_states().clone()))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn one_sided(refiner: &mut Refiner, link: &mut Link<ChannelComm>, partition: &mut Partition, adjacency: &mut AdjacencyMap) -> Result<Option<MeshChange>> {
        let criterion = if partition.rank() == 0 {
            Criterion::Uniform
        } else {
            Criterion::EdgeList(vec![])
        };
        refiner.refine(link, partition, adjacency, &criterion)
    }

    #[test]
    fn neighbor_refinement_is_forced_across_the_boundary() {
        let results = run(slabs(2, 2), &RefineConfig::default(), one_sided);
        let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();

        let mut coord_of_gid = HashMap::new();

        for (partition, adjacency, change, states) in &results {
            assert!(change.is_some());
            assert_eq!(partition.generation(), Generation(1));
            partition.check().unwrap();
            assert!(!states.is_empty());
            assert!(states.values().all(|s| s.is_split()));

            for (lid, &gid) in partition.gid().iter().enumerate() {
                let x = partition.coord()[lid];
                if let Some(y) = coord_of_gid.insert(gid, x) {
                    assert_eq!(x, y, "node {} placed differently", gid);
                }
                if adjacency.is_shared(gid) {
                    assert!(adjacency.neighbors_of_node(gid).all(|p| p != partition.rank()));
                }
            }
        }
        AdjacencyMap::check_symmetric(&results.iter().map(|r| r.1.clone()).collect::<Vec<_>>()).unwrap();

        let (s0, s1) = (&results[0].3, &results[1].3);
        assert_eq!(s0.keys().collect::<Vec<_>>(), s1.keys().collect::<Vec<_>>());

        let total: f64 = results.iter().flat_map(|r| r.0.element_volumes()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn shared_midpoints_get_one_global_id() {
        let results: Vec<_> = run(slabs(2, 2), &RefineConfig::default(), one_sided)
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let next_gid = results[0].0.next_gid();
        assert_eq!(next_gid, results[1].0.next_gid());

        let mut gids: Vec<u64> = results.iter().flat_map(|r| r.0.gid().iter().copied()).collect();
        gids.sort_unstable();
        gids.dedup();
        assert_eq!(gids.len() as u64, next_gid);
    }

    #[test]
    fn no_marks_anywhere_changes_nothing() {
        let results = run(slabs(2, 3), &RefineConfig::default(), |r, link, p, a| {
            r.refine(link, p, a, &Criterion::EdgeList(vec![]))
        });
        for result in results {
            let (partition, _, change, _) = result.unwrap();
            assert!(change.is_none());
            assert_eq!(partition.generation(), Generation(0));
        }
    }

    #[test]
    fn running_out_of_correction_rounds_is_reported() {
        let config = RefineConfig {
            max_correction_rounds: 1,
            ..RefineConfig::default()
        };
        let results = run(slabs(2, 2), &config, one_sided);

        for result in results {
            assert!(matches!(result, Err(Error::RefinementDiverged { rounds: 1, .. })));
        }
    }

    #[test]
    fn uniform_derefinement_restores_the_mesh() {
        let parts = slabs(2, 2);
        let before: Vec<(usize, usize)> = parts.iter().map(|(p, _)| (p.num_elements(), p.num_nodes())).collect();

        let results = run(parts, &RefineConfig::default(), |r, link, p, a| {
            r.refine(link, p, a, &Criterion::Uniform)?;
            r.derefine(link, p, a, &Criterion::Uniform)
        });

        for (result, (nelem, nnode)) in results.into_iter().zip(before) {
            let (partition, adjacency, change, _) = result.unwrap();
            assert!(change.is_some());
            assert_eq!(partition.generation(), Generation(2));
            assert_eq!(partition.num_elements(), nelem);
            assert_eq!(partition.num_nodes(), nnode);
            assert!(partition.history().is_empty());
            assert!(adjacency.shared_nodes().all(|g| partition.to_local(g).is_some()));
        }
    }

    #[test]
    fn refused_derefinement_names_the_dropped_edges() {
        let config = RefineConfig {
            max_correction_rounds: 1,
            ..RefineConfig::default()
        };
        let results = run(slabs(2, 2), &config, |r, link, p, a| {
            r.refine(link, p, a, &Criterion::Uniform)?;
            let criterion = if p.rank() == 0 {
                Criterion::Uniform
            } else {
                Criterion::EdgeList(vec![])
            };
            r.derefine(link, p, a, &criterion)
        });

        match &results[0] {
            Err(Error::RefinementDiverged { rank: 0, rounds: 1, edges }) => {
                assert!(!edges.is_empty());
                assert!(edges.iter().any(|d| d.partitions == vec![0, 1]));
            }
            other => panic!("expected a diverged derefinement, got {:?}", other.as_ref().map(|_| ())),
        }
        assert!(matches!(results[1], Err(Error::RefinementDiverged { rank: 1, .. })));
    }

    #[test]
    fn refinement_levels_follow_the_history() {
        let results = run(slabs(2, 1), &RefineConfig::default(), |r, link, p, a| {
            r.refine(link, p, a, &Criterion::Uniform)
        });
        let (partition, ..) = results.into_iter().next().unwrap().unwrap();
        assert!(refinement_fields(&partition).iter().all(|&l| l == 1.0));
    }
}
