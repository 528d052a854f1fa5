use core::hash::Hash;
use std::collections::hash_map::{Entry, HashMap};

use crate::error::{Error, Result};

/// Returned by [`Automaton::receive`] to indicate whether a task is eligible
/// to be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Eligible,
    Ineligible,
}

impl Status {
    pub fn eligible_if(condition: bool) -> Self {
        if condition {
            Self::Eligible
        } else {
            Self::Ineligible
        }
    }

    pub fn is_eligible(self) -> bool {
        self == Self::Eligible
    }
}

/// An agent in a group of tasks that exchanges messages with its peers, and
/// yields a data product once it has heard from all of them. Tasks own their
/// data and transfer ownership of message content to the recipient; nothing
/// is shared between tasks. In this crate the automata are the per-partition
/// sides of one halo exchange round, and the yielded value is the merged
/// boundary array.
///
pub trait Automaton {
    /// The type of the key to uniquely identify this automaton within a
    /// group. Executors will generally require this type to be `Hash + Eq`,
    /// and also `Send` if the executor is multi-threaded.
    type Key;

    /// The type of a message to be passed between the automata. Each stage of
    /// computation requires the receipt of zero or one messages from each of
    /// the other automata in the group in order to yield a value.
    type Message;

    /// The type of the value yielded by this automaton. It may be computed on
    /// a worker thread at the discretion of the executor.
    type Value;

    /// Return the key to uniquely identify this automaton within the group.
    fn key(&self) -> Self::Key;

    /// Return a list of messages to be sent to peers.
    fn messages(&self) -> Vec<(Self::Key, Self::Message)>;

    /// Receive and store a message from another task. Returns whether the
    /// task has now received all of its incoming messages and is ready to
    /// yield a value, or an error if the message is one the task can never
    /// accept (an unknown or repeated sender, a malformed payload).
    fn receive(&mut self, message: Self::Message) -> Result<Status>;

    /// Return true if the task expects no messages at all, and is eligible
    /// as soon as the executor sees it.
    fn is_independent(&self) -> bool {
        false
    }

    /// Run the task. CPU-intensive work should be done in this method only.
    fn value(self) -> Self::Value;
}

/// Execute a group of tasks in serial. Returns an error if a message is
/// rejected, or if some task is still waiting for messages when the group is
/// exhausted.
///
pub fn execute<I, A, K, V>(stage: I) -> Result<impl Iterator<Item = V>>
where
    I: IntoIterator<Item = A>,
    A: Automaton<Key = K, Value = V>,
    K: Hash + Eq,
{
    let (eligible_sink, eligible_source) = crossbeam_channel::unbounded();

    coordinate(stage, eligible_sink)?;

    Ok(eligible_source.into_iter().map(|peer: A| peer.value()))
}

/// Execute a group of tasks in parallel. Tasks are spawned into the given
/// Rayon scope. The coordinator delivers messages between tasks as they are
/// yielded by the `flow` iterator, and sends them to the dispatcher when they
/// have become eligible. The dispatcher moves tasks into the Rayon thread
/// pool for execution, and then delivers their result into the output
/// channel. The result iterator generally yields values well after this
/// function has returned.
///
/// _Note_: There must be at least two threads running in the Rayon thread
/// pool, because the coordinator and dispatcher need to run in parallel.
///
pub fn execute_par<'a, I, A, K, V>(scope: &rayon::Scope<'a>, flow: I) -> Result<impl Iterator<Item = V>>
where
    I: IntoIterator<Item = A>,
    A: Send + Automaton<Key = K, Value = V> + 'a,
    K: Hash + Eq,
    V: Send + 'a,
{
    use rayon::prelude::*;

    if rayon::current_num_threads() < 2 {
        return Err(Error::Channel("automaton::execute_par requires at least two threads".into()));
    }

    let (eligible_sink, eligible_source) = crossbeam_channel::unbounded();
    let (computed_sink, computed_source) = crossbeam_channel::unbounded();

    scope.spawn(move |_| {
        eligible_source
            .into_iter()
            .par_bridge()
            .for_each(|peer: A| {
                // The output side hung up; nobody wants the value.
                let _ = computed_sink.send(peer.value());
            })
    });

    coordinate(flow, eligible_sink)?;
    Ok(computed_source.into_iter())
}

fn coordinate<I, A, K, V>(flow: I, eligible: crossbeam_channel::Sender<A>) -> Result<()>
where
    I: IntoIterator<Item = A>,
    A: Automaton<Key = K, Value = V>,
    K: Hash + Eq,
{
    let dispatch = |a: A| {
        eligible
            .send(a)
            .map_err(|_| Error::Channel("automaton dispatcher hung up".into()))
    };
    let mut seen: HashMap<K, A> = HashMap::new();
    let mut undelivered = Vec::new();

    for mut a in flow {
        // For each of A's messages, either deliver it to the recipient peer,
        // if the peer has already been seen, or otherwise put it in the
        // undelivered box.
        //
        for (dest, data) in a.messages() {
            match seen.entry(dest) {
                Entry::Occupied(mut entry) => {
                    if entry.get_mut().receive(data)?.is_eligible() {
                        dispatch(entry.remove())?;
                    }
                }
                Entry::Vacant(none) => undelivered.push((none.into_key(), data)),
            }
        }

        // Deliver any messages addressed to A that had arrived previously.
        //
        let dest = a.key();
        let mut i = 0;
        let mut is_eligible = a.is_independent();

        while !is_eligible && i != undelivered.len() {
            if undelivered[i].0 == dest {
                is_eligible = a.receive(undelivered.remove(i).1)?.is_eligible();
            } else {
                i += 1;
            }
        }

        if is_eligible {
            dispatch(a)?;
        } else {
            seen.insert(dest, a);
        }
    }

    if !seen.is_empty() || !undelivered.is_empty() {
        return Err(Error::Stalled {
            pending: seen.len() + undelivered.len(),
        });
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    /// Each peer sends its number to the others and yields the sum.
    struct Summer {
        key: usize,
        peers: Vec<usize>,
        total: u64,
        heard: usize,
    }

    impl Automaton for Summer {
        type Key = usize;
        type Message = u64;
        type Value = (usize, u64);

        fn key(&self) -> usize {
            self.key
        }

        fn messages(&self) -> Vec<(usize, u64)> {
            self.peers.iter().map(|&p| (p, self.key as u64)).collect()
        }

        fn receive(&mut self, message: u64) -> Result<Status> {
            self.total += message;
            self.heard += 1;
            Ok(Status::eligible_if(self.heard == self.peers.len()))
        }

        fn is_independent(&self) -> bool {
            self.peers.is_empty()
        }

        fn value(self) -> (usize, u64) {
            (self.key, self.total + self.key as u64)
        }
    }

    fn group(n: usize) -> Vec<Summer> {
        (0..n)
            .map(|key| Summer {
                key,
                peers: (0..n).filter(|&p| p != key).collect(),
                total: 0,
                heard: 0,
            })
            .collect()
    }

    #[test]
    fn serial_execution_yields_every_value() {
        let mut values: Vec<_> = execute(group(5)).unwrap().collect();
        values.sort();
        assert_eq!(values.len(), 5);
        assert!(values.iter().all(|&(_, total)| total == 10));
    }

    #[test]
    fn parallel_execution_yields_every_value() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let values: Vec<_> = pool.scope(|scope| execute_par(scope, group(6)).unwrap().collect());
        assert_eq!(values.len(), 6);
        assert!(values.iter().all(|&(_, total)| total == 15));
    }

    #[test]
    fn a_lone_automaton_is_eligible_immediately() {
        let values: Vec<_> = execute(group(1)).unwrap().collect();
        assert_eq!(values, vec![(0, 0)]);
    }

    #[test]
    fn a_missing_peer_stalls_the_group() {
        let mut peers = group(3);
        peers.pop();
        assert!(matches!(execute(peers).err(), Some(Error::Stalled { .. })));
    }
}
