use super::comm::Communicator;
use super::ordered::{Body, Envelope, Inbox};
use crate::error::Result;
use crate::mesh::Generation;




/// Everything one partition needs to talk to the others: a collective plane
/// for reductions and gathers, and a generation-ordered inbox on a separate
/// data plane for point-to-point traffic. Keeping the two apart means a
/// blocking collective never consumes a halo or refinement message.
///
pub struct Link<C> {
    collective: C,
    inbox: Inbox<C>,
}

impl<C: Communicator> Link<C> {
    pub fn new(collective: C, data: C, generation: Generation) -> Self {
        Self {
            collective,
            inbox: Inbox::new(data, generation),
        }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn size(&self) -> usize {
        self.collective.size()
    }

    pub fn generation(&self) -> Generation {
        self.inbox.generation()
    }

    pub fn post(&self, to: usize, body: Body) -> Result<()> {
        self.inbox.post(to, body)
    }

    pub fn next<F>(&mut self, accept: F) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        self.inbox.next(accept)
    }

    pub fn advance(&mut self, generation: Generation) {
        self.inbox.advance(generation)
    }

    pub fn sum_u64(&self, x: u64) -> Result<u64> {
        self.collective.all_reduce_u64(x, |a, b| a + b)
    }

    pub fn max_u64(&self, x: u64) -> Result<u64> {
        self.collective.all_reduce_u64(x, u64::max)
    }

    pub fn sum_f64(&self, x: f64) -> Result<f64> {
        self.collective.all_reduce_f64(x, |a, b| a + b)
    }

    pub fn min_f64(&self, x: f64) -> Result<f64> {
        self.collective.all_reduce_f64(x, f64::min)
    }

    pub fn gather_u64(&self, x: u64) -> Result<Vec<u64>> {
        self.collective.all_gather_u64(x)
    }
}
