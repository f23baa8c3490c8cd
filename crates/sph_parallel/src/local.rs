//! In-process communicator: ranks are threads of one process.
//!
//! Used to exercise multi-rank bootstrap and partitioning without an MPI
//! runtime. Each [`LocalCommunicator`] of a group is moved onto its own
//! thread.

use std::fmt;
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use crate::rank::Communicator;

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<u64>>,
}

/// One rank of an in-process group.
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalCommunicator {
    /// Create a group of `size` communicators, indexed by rank.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "a communicator group needs at least one rank");
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn all_gather(&self, value: u64) -> Vec<u64> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[self.rank] = value;
        self.shared.barrier.wait();
        let gathered = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Nobody may overwrite a slot until every rank has read the round.
        self.shared.barrier.wait();
        gathered
    }

    fn abort(&self, code: i32) -> ! {
        panic!("rank {} aborted the local group with code {code}", self.rank)
    }
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_all_gather_collects_by_rank() {
        let handles: Vec<_> = LocalCommunicator::group(4)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let first = comm.all_gather(comm.rank() as u64 * 10);
                    let second = comm.all_gather(comm.rank() as u64 + 100);
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![0, 10, 20, 30]);
            assert_eq!(second, vec![100, 101, 102, 103]);
        }
    }

    #[test]
    fn test_barrier_releases_all_ranks() {
        let handles: Vec<_> = LocalCommunicator::group(3)
            .into_iter()
            .map(|comm| thread::spawn(move || comm.barrier()))
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
