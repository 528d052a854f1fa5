use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::comm::Communicator;
use crate::amr::{Edge, EdgeState};
use crate::error::Result;
use crate::halo::HaloMessage;
use crate::mesh::Generation;




/// The payload of a point-to-point message between partitions.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Halo(HaloMessage),
    /// Edges the sender holds whose end points are both shared with the
    /// receiver; the receiver confirms the ones it holds too.
    BoundaryEdges(Vec<Edge<u64>>),
    /// Refinement state of every marked edge shared with the receiver.
    EdgeStates {
        round: usize,
        states: Vec<(Edge<u64>, EdgeState)>,
    },
    /// Global IDs assigned to the midpoints of shared edges.
    NodeIds(Vec<(Edge<u64>, u64)>),
    /// Shared split edges the sender is willing to un-split.
    Unsplit {
        round: usize,
        edges: Vec<Edge<u64>>,
    },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Halo(_) => "halo",
            Body::BoundaryEdges(_) => "boundary-edges",
            Body::EdgeStates { .. } => "edge-states",
            Body::NodeIds(_) => "node-ids",
            Body::Unsplit { .. } => "unsplit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: usize,
    pub generation: Generation,
    pub body: Body,
}




/// Inbox enforces the generation ordering on incoming messages. Messages
/// from an older generation are dropped with a warning, and messages from a
/// future generation are kept until the local partition has reached that
/// generation. Messages of the current generation that the caller is not
/// waiting for yet are held back and replayed on a later call to `next`.
///
pub struct Inbox<C> {
    comm: C,
    generation: Generation,
    held: VecDeque<Envelope>,
    future: BTreeMap<Generation, Vec<Envelope>>,
}

impl<C: Communicator> Inbox<C> {
    pub fn new(comm: C, generation: Generation) -> Self {
        Self {
            comm,
            generation,
            held: VecDeque::new(),
            future: BTreeMap::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Return the number of messages received but not yet handed out.
    pub fn pending(&self) -> usize {
        self.held.len() + self.future.values().map(Vec::len).sum::<usize>()
    }

    /// Send a message, tagged with the current generation.
    pub fn post(&self, to: usize, body: Body) -> Result<()> {
        let envelope = Envelope {
            from: self.comm.rank(),
            generation: self.generation,
            body,
        };
        self.comm.send(to, rmp_serde::to_vec(&envelope)?)
    }

    /// Return the first message of the current generation that `accept`
    /// takes, blocking until one arrives.
    pub fn next<F>(&mut self, accept: F) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        if let Some(i) = self.held.iter().position(|e| accept(e)) {
            if let Some(envelope) = self.held.remove(i) {
                return Ok(envelope);
            }
        }
        loop {
            let envelope: Envelope = rmp_serde::from_slice(&self.comm.recv()?)?;

            match envelope.generation.cmp(&self.generation) {
                Ordering::Less => warn!(
                    "[rank {}] dropping stale {} message from rank {} ({}, now {})",
                    self.comm.rank(),
                    envelope.body.kind(),
                    envelope.from,
                    envelope.generation,
                    self.generation
                ),
                Ordering::Greater => {
                    debug!(
                        "[rank {}] buffering {} message from rank {} for {}",
                        self.comm.rank(),
                        envelope.body.kind(),
                        envelope.from,
                        envelope.generation
                    );
                    self.future.entry(envelope.generation).or_default().push(envelope)
                }
                Ordering::Equal if accept(&envelope) => return Ok(envelope),
                Ordering::Equal => self.held.push_back(envelope),
            }
        }
    }

    /// Move to a new generation. Held messages of the old generation are
    /// dropped; buffered messages of the new one become available.
    pub fn advance(&mut self, generation: Generation) {
        for envelope in self.held.drain(..) {
            warn!(
                "[rank {}] dropping unconsumed {} message from rank {} ({})",
                self.comm.rank(),
                envelope.body.kind(),
                envelope.from,
                envelope.generation
            );
        }
        self.generation = generation;

        let later = self.future.split_off(&generation.next());
        let ready = std::mem::replace(&mut self.future, later);

        for (g, envelopes) in ready {
            if g == generation {
                debug!("[rank {}] flushing {} messages buffered for {}", self.comm.rank(), envelopes.len(), g);
                self.held.extend(envelopes);
            } else {
                warn!("[rank {}] dropping {} messages of skipped {}", self.comm.rank(), envelopes.len(), g);
            }
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::message::ChannelHost;

    fn is_node_ids(e: &Envelope) -> bool {
        matches!(e.body, Body::NodeIds(_))
    }

    #[test]
    fn future_messages_wait_for_their_generation() {
        let host = ChannelHost::new();
        let mut plane = host.plane(2);
        let mut receiver = Inbox::new(plane.remove(1), Generation(0));
        let mut sender = Inbox::new(plane.remove(0), Generation(0));

        sender.advance(Generation(1));
        sender.post(1, Body::NodeIds(vec![(Edge::new(1, 2), 7)])).unwrap();
        sender.advance(Generation(0));
        sender.post(1, Body::NodeIds(vec![])).unwrap();

        let first = receiver.next(is_node_ids).unwrap();
        assert_eq!(first.body, Body::NodeIds(vec![]));
        assert_eq!(receiver.pending(), 1);

        receiver.advance(Generation(1));
        let second = receiver.next(is_node_ids).unwrap();
        assert_eq!(second.generation, Generation(1));
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn stale_messages_are_dropped_and_others_held() {
        let host = ChannelHost::new();
        let mut plane = host.plane(2);
        let mut receiver = Inbox::new(plane.remove(1), Generation(3));
        let mut sender = Inbox::new(plane.remove(0), Generation(2));

        sender.post(1, Body::BoundaryEdges(vec![])).unwrap();
        sender.advance(Generation(3));
        sender.post(1, Body::BoundaryEdges(vec![Edge::new(4, 5)])).unwrap();
        sender.post(1, Body::NodeIds(vec![])).unwrap();

        let envelope = receiver.next(is_node_ids).unwrap();
        assert_eq!(envelope.from, 0);
        assert_eq!(receiver.pending(), 1);

        let held = receiver.next(|e| matches!(e.body, Body::BoundaryEdges(_))).unwrap();
        assert_eq!(held.body, Body::BoundaryEdges(vec![Edge::new(4, 5)]));
    }
}
