use std::collections::BTreeMap;

use crate::error::Result;

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Interface for a group of partitions that can exchange byte messages. The
/// underlying transport is in-process channels here, but could in principle
/// be TCP or MPI.
///
/// The provided collectives use binomial trees rooted at rank 0. They assume
/// every member enters the same sequence of collectives, and that nothing
/// else travels over this communicator, since `recv` accepts a message from
/// any peer.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this partition within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of members of this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>) -> Result<()>;

    /// Must be implemented to receive a message from any of the peers. This
    /// method is allowed to block until a message is ready to be received.
    fn recv(&self) -> Result<Vec<u8>>;

    /// Implements a binomial tree broadcast from rank 0. The message buffer
    /// must be `Some` on rank 0, and `None` otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv()?,
        };
        for level in (0..ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, value.clone())?
            }
        }
        Ok(value)
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// rank 0. The operator must be commutative and associative, since
    /// children are combined in arrival order.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Result<Option<Vec<u8>>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let r = self.rank();
        let p = self.size();

        for level in 0..ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv()?)?
                }
            } else {
                self.send(r - one, value)?;
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Result<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let reduced = self.reduce(f, value)?;
        self.broadcast(reduced)
    }

    /// All-reduce of one real. Every member gets the same bits back.
    ///
    fn all_reduce_f64(&self, x: f64, op: fn(f64, f64) -> f64) -> Result<f64> {
        let f = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let a: f64 = rmp_serde::from_slice(&a)?;
            let b: f64 = rmp_serde::from_slice(&b)?;
            Ok(rmp_serde::to_vec(&op(a, b))?)
        };
        let bytes = self.all_reduce(f, rmp_serde::to_vec(&x)?)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    fn all_reduce_u64(&self, x: u64, op: fn(u64, u64) -> u64) -> Result<u64> {
        let f = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let a: u64 = rmp_serde::from_slice(&a)?;
            let b: u64 = rmp_serde::from_slice(&b)?;
            Ok(rmp_serde::to_vec(&op(a, b))?)
        };
        let bytes = self.all_reduce(f, rmp_serde::to_vec(&x)?)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Gather one number from every member, indexed by rank, on every
    /// member.
    ///
    fn all_gather_u64(&self, x: u64) -> Result<Vec<u64>> {
        let f = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
            let mut a: BTreeMap<usize, u64> = rmp_serde::from_slice(&a)?;
            let b: BTreeMap<usize, u64> = rmp_serde::from_slice(&b)?;
            a.extend(b);
            Ok(rmp_serde::to_vec(&a)?)
        };
        let mine: BTreeMap<usize, u64> = [(self.rank(), x)].into_iter().collect();
        let bytes = self.all_reduce(f, rmp_serde::to_vec(&mine)?)?;
        let all: BTreeMap<usize, u64> = rmp_serde::from_slice(&bytes)?;
        Ok(all.into_values().collect())
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn ceil_log2_works() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }
}
