//! Distributed execution context.
//!
//! Every pipeline stage receives a [`Comm`] explicitly. A stage takes its share of the work with
//! [`Comm::partition`], computes a partial result of full size (zeros outside its share) and
//! combines the partial results with [`Comm::all_reduce_sum`] or [`Comm::reduce_sum`].
use std::{
    any::Any,
    ops::AddAssign,
    sync::{
        Arc,
        Barrier,
        Mutex,
    },
};

use anyhow::{
    anyhow,
    bail,
    ensure,
};
use ndarray::{
    Array,
    Dimension,
};

use crate::types::Result;


/// Contiguous half-open range `(start, end)` of `n` items owned by `worker` out of `nworkers`.
///
/// The first `n % nworkers` workers get one extra item, so the sizes of any two ranges differ by
/// at most one and the ranges tile `0 .. n` in worker order.
pub fn load_balancing(n: usize, nworkers: usize, worker: usize) -> Result<(usize, usize)> {
    ensure!(nworkers > 0 && worker < nworkers, "Invalid worker {} of {}.", worker, nworkers);
    let base  = n / nworkers;
    let extra = n % nworkers;
    let start = worker * base + worker.min(extra);
    let len   = base + usize::from(worker < extra);
    Ok((start, start + len))
}


pub trait Comm: Sync {
    fn size(&self) -> usize;

    fn rank(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// This worker's share of `n` independent items.
    fn partition(&self, n: usize) -> Result<(usize, usize)> {
        load_balancing(n, self.size(), self.rank())
    }

    /// Sum of the partial arrays of all workers, returned to every worker.
    fn all_reduce_sum<T, D>(&self, partial: Array<T, D>) -> Result<Array<T, D>>
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static;

    /// Sum of the partial arrays of all workers, returned to the root worker only.
    fn reduce_sum<T, D>(&self, partial: Array<T, D>) -> Result<Option<Array<T, D>>>
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static {
        let total = self.all_reduce_sum(partial)?;
        Ok(if self.is_root() { Some(total) } else { None })
    }

    /// Agree on the outcome of a step each worker ran on its own share: if any worker failed,
    /// every worker returns an error, so nobody is left waiting in a later reduction.
    fn agree<T>(&self, local: Result<T>) -> Result<T> {
        let failed = ndarray::arr1(&[i64::from(local.is_err())]);
        let nfailed = self.all_reduce_sum(failed)?[0];
        match local {
            Err(e) => Err(e),
            Ok(_) if nfailed > 0 => bail!("{} worker(s) failed, aborting.", nfailed),
            Ok(v) => Ok(v),
        }
    }
}


/// Trivial context with a single worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;


impl Comm for SerialComm {
    fn size(&self) -> usize { 1 }

    fn rank(&self) -> usize { 0 }

    fn all_reduce_sum<T, D>(&self, partial: Array<T, D>) -> Result<Array<T, D>>
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static {
        Ok(partial)
    }
}


enum Slot {
    Empty,
    Sum(Box<dyn Any + Send>),
    Failed(String),
}


struct Shared {
    size:    usize,
    barrier: Barrier,
    slot:    Mutex<Slot>,
}


/// One worker of a group of threads sharing a reduction slot.
///
/// All workers of a group must call the same reductions in the same order. A worker that
/// contributes a mismatching array poisons the round, and every worker of the group then
/// returns the error instead of blocking.
#[derive(Clone)]
pub struct ThreadComm {
    rank:   usize,
    shared: Arc<Shared>,
}


impl ThreadComm {
    /// Build `size` connected workers, hand one to each thread.
    pub fn group(size: usize) -> Result<Vec<Self>> {
        if size == 0 {
            bail!("A worker group needs at least one worker.");
        }
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            slot:    Mutex::new(Slot::Empty),
        });
        Ok((0 .. size)
            .map(|rank| Self { rank, shared: Arc::clone(&shared) })
            .collect())
    }

    fn contribute<T, D>(&self, partial: Array<T, D>)
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static {
        let mut slot = match self.shared.slot.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        let next = match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Empty => Slot::Sum(Box::new(partial)),
            Slot::Failed(msg) => Slot::Failed(msg),
            Slot::Sum(mut acc) => {
                let merged = match acc.downcast_mut::<Array<T, D>>() {
                    Some(sum) if sum.shape() == partial.shape() => {
                        sum.zip_mut_with(&partial, |a, b| *a += *b);
                        Ok(())
                    },
                    Some(sum) => Err(format!(
                        "Worker {} contributed shape {:?} to a reduction of shape {:?}.",
                        self.rank, partial.shape(), sum.shape())),
                    None => Err(format!(
                        "Worker {} contributed an array of a different type to the reduction.", self.rank)),
                };
                match merged {
                    Ok(())   => Slot::Sum(acc),
                    Err(msg) => Slot::Failed(msg),
                }
            },
        };
        *slot = next;
    }

    fn collect<T, D>(&self) -> Result<Array<T, D>>
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static {
        let slot = match self.shared.slot.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*slot {
            Slot::Sum(acc) => acc.downcast_ref::<Array<T, D>>()
                .cloned()
                .ok_or_else(|| anyhow!("Reduction result has an unexpected type.")),
            Slot::Failed(msg) => Err(anyhow!("Reduction aborted: {}", msg)),
            Slot::Empty => Err(anyhow!("Reduction finished without contributions.")),
        }
    }

    fn reset(&self) {
        let mut slot = match self.shared.slot.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Slot::Empty;
    }
}


impl Comm for ThreadComm {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_sum<T, D>(&self, partial: Array<T, D>) -> Result<Array<T, D>>
    where T: Copy + AddAssign + Send + 'static,
          D: Dimension + 'static {
        self.contribute(partial);
        self.shared.barrier.wait();

        let total = self.collect();
        if self.shared.barrier.wait().is_leader() {
            self.reset();
        }
        // nobody starts the next round before the slot is cleared
        self.shared.barrier.wait();

        total
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use ndarray::{
        arr1,
        Array1,
        Array2,
    };

    #[test]
    fn test_load_balancing() {
        assert_eq!(load_balancing(10, 3, 0).unwrap(), (0, 4));
        assert_eq!(load_balancing(10, 3, 1).unwrap(), (4, 7));
        assert_eq!(load_balancing(10, 3, 2).unwrap(), (7, 10));
        assert_eq!(load_balancing(2, 4, 3).unwrap(), (2, 2));
        assert!(load_balancing(10, 3, 3).is_err());
        assert!(load_balancing(10, 0, 0).is_err());

        for n in 0 .. 40 {
            for nworkers in 1 .. 9 {
                let mut next = 0;
                for w in 0 .. nworkers {
                    let (start, end) = load_balancing(n, nworkers, w).unwrap();
                    assert_eq!(start, next);
                    assert!(end - start <= n / nworkers + 1);
                    next = end;
                }
                assert_eq!(next, n);
            }
        }
    }

    #[test]
    fn test_serial_comm() {
        let comm = SerialComm;
        assert_eq!(comm.partition(7).unwrap(), (0, 7));
        let v = arr1(&[1.0, 2.0]);
        assert_eq!(comm.all_reduce_sum(v.clone()).unwrap(), v);
        assert_eq!(comm.reduce_sum(v.clone()).unwrap(), Some(v));
    }

    #[test]
    fn test_thread_comm_reductions() {
        let group = ThreadComm::group(4).unwrap();
        let results = thread::scope(|s| {
            let handles = group.into_iter()
                .map(|comm| s.spawn(move || {
                    let (start, end) = comm.partition(10).unwrap();
                    let mut partial = Array1::<f64>::zeros(10);
                    for i in start .. end {
                        partial[i] = i as f64;
                    }
                    let all = comm.all_reduce_sum(partial).unwrap();

                    // second round with a different type and shape
                    let ones = Array2::<i64>::ones((2, 2));
                    let root = comm.reduce_sum(ones).unwrap();
                    (comm.rank(), all, root)
                }))
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });

        let expected = Array1::from_iter((0 .. 10).map(|i| i as f64));
        for (rank, all, root) in results {
            assert_eq!(all, expected);
            if rank == 0 {
                assert_eq!(root, Some(Array2::<i64>::from_elem((2, 2), 4)));
            } else {
                assert!(root.is_none());
            }
        }
    }

    #[test]
    fn test_thread_comm_mismatch_aborts_all() {
        let group = ThreadComm::group(3).unwrap();
        let results = thread::scope(|s| {
            let handles = group.into_iter()
                .map(|comm| s.spawn(move || {
                    let n = if comm.rank() == 1 { 5 } else { 4 };
                    comm.all_reduce_sum(Array1::<f64>::zeros(n)).is_err()
                }))
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });
        // the mismatch is detected no matter which worker arrives first
        let nerr = results.iter().filter(|e| **e).count();
        assert_eq!(nerr, 3);
    }

    #[test]
    fn test_agree() {
        let group = ThreadComm::group(3).unwrap();
        let results = thread::scope(|s| {
            let handles = group.into_iter()
                .map(|comm| s.spawn(move || {
                    let local = if comm.rank() == 2 { Err(anyhow!("bad k-point")) } else { Ok(comm.rank()) };
                    let first = comm.agree(local).is_err();
                    let second = comm.agree(Ok(comm.rank())).unwrap();
                    (first, second)
                }))
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });
        for (rank, (failed, value)) in results.into_iter().enumerate() {
            assert!(failed);
            assert_eq!(value, rank);
        }

        assert_eq!(SerialComm.agree(Ok(3)).unwrap(), 3);
    }

    #[test]
    fn test_empty_group() {
        assert!(ThreadComm::group(0).is_err());
    }
}
