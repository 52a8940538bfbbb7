//! Simple thread pool for processing batches of per-block matrix
//! multiplies.
//!
//! The block matcher produces a list of mutually independent multiply jobs:
//! no job reads another's output, and every job's result lands in its own
//! pre-allocated output slot. The pool distributes jobs over worker threads
//! through a single-producer, multiple-consumer channel and writes results
//! back by slot index, never by shared append, so the only synchronization
//! point is the implicit barrier at the end of [`run`][ContractorPool::run]
//! before the caller assembles the result.

use std::thread;
use crossbeam::channel;
use ndarray as nd;
use thiserror::Error;
use crate::Elem;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to enqueue multiplies: dead thread")]
    DeadThread,

    #[error("failed to enqueue multiplies: closed sender channel")]
    ClosedSenderChannel,

    #[error("failed to receive multiply result: receiver error: {0}")]
    ClosedReceiverChannel(channel::RecvError),

    #[error("encountered receiver error from within a thread: receiver error: {0}")]
    WorkerReceiverError(channel::RecvError),
}
use PoolError::*;
pub type PoolResult<T> = Result<T, PoolError>;

#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
enum ToWorker<A> {
    Stop,
    Work {
        slot: usize,
        alpha: A,
        lhs: nd::Array2<A>,
        rhs: nd::Array2<A>,
    },
}

#[allow(clippy::large_enum_variant)]
#[derive(Clone, Debug)]
enum FromWorker<A> {
    RecvError(channel::RecvError),
    Output(usize, nd::Array2<A>),
}

/// A simple thread pool to run batches of independent matrix multiplies in
/// parallel.
///
/// Workload between threads is automatically balanced by means of a
/// single-producer, multiple-consumer channel. Each job carries the index
/// of its output slot, and [`run`][Self::run] returns results in slot
/// order regardless of completion order. The pool as a whole is meant to
/// be reused between batches, and is **not** thread-safe.
#[derive(Debug)]
pub struct ContractorPool<A> {
    threads: Vec<thread::JoinHandle<()>>,
    workers_in: channel::Sender<ToWorker<A>>,
    workers_out: channel::Receiver<FromWorker<A>>,
}

impl<A> ContractorPool<A>
where A: Elem
{
    /// Create a new thread pool of `nthreads` threads.
    pub fn new(nthreads: usize) -> Self {
        let (tx_in, rx_in) = channel::unbounded();
        let (tx_out, rx_out) = channel::unbounded();
        let mut threads = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            let worker_receiver: channel::Receiver<ToWorker<A>> =
                rx_in.clone();
            let worker_sender = tx_out.clone();
            let th = thread::spawn(move || loop {
                match worker_receiver.recv() {
                    Ok(ToWorker::Stop) => { break; },
                    Ok(ToWorker::Work { slot, alpha, lhs, rhs }) => {
                        let mut out: nd::Array2<A> =
                            nd::Array2::zeros((lhs.nrows(), rhs.ncols()));
                        nd::linalg::general_mat_mul(
                            alpha, &lhs, &rhs, A::zero(), &mut out);
                        match worker_sender
                            .send(FromWorker::Output(slot, out))
                        {
                            Ok(()) => { continue; },
                            Err(err) => { panic!("sender error: {err}"); },
                        }
                    },
                    Err(err) => {
                        match worker_sender.send(FromWorker::RecvError(err)) {
                            Ok(()) => { panic!("receiver error"); },
                            Err(_) => { panic!("sender error: {err}"); },
                        }
                    },
                }
            });
            threads.push(th);
        }
        Self { threads, workers_in: tx_in, workers_out: rx_out }
    }

    /// Create a new thread pool with the number of threads equal to the
    /// number of logical CPU cores available in the current system.
    pub fn new_cpus() -> Self { Self::new(num_cpus::get()) }

    /// Create a new thread pool with the number of threads equal to the
    /// number of physical CPU cores available in the current system.
    pub fn new_physical() -> Self { Self::new(num_cpus::get_physical()) }

    /// Enqueue a batch of multiplies `alpha · lhs · rhs` to be distributed
    /// across all threads, returning results in job order.
    ///
    /// This method blocks until every enqueued multiply has completed; the
    /// return is therefore a barrier between the multiply phase and result
    /// assembly.
    pub fn run(
        &self,
        alpha: A,
        jobs: Vec<(nd::Array2<A>, nd::Array2<A>)>,
    ) -> PoolResult<Vec<nd::Array2<A>>>
    {
        if self.threads.iter().any(|th| th.is_finished()) {
            return Err(DeadThread);
        }
        let count = jobs.len();
        for (slot, (lhs, rhs)) in jobs.into_iter().enumerate() {
            self.workers_in
                .send(ToWorker::Work { slot, alpha, lhs, rhs })
                .map_err(|_| ClosedSenderChannel)?;
        }
        let mut output: Vec<Option<nd::Array2<A>>> =
            (0..count).map(|_| None).collect();
        for _ in 0..count {
            match self.workers_out.recv() {
                Ok(FromWorker::Output(slot, data)) => {
                    output[slot] = Some(data);
                },
                Ok(FromWorker::RecvError(err)) => {
                    return Err(WorkerReceiverError(err));
                },
                Err(err) => { return Err(ClosedReceiverChannel(err)); },
            }
        }
        // every slot is written exactly once by the loop above
        Ok(output.into_iter().map(|o| o.unwrap()).collect())
    }
}

impl<A> Drop for ContractorPool<A> {
    fn drop(&mut self) {
        (0..self.threads.len())
            .for_each(|_| { self.workers_in.send(ToWorker::Stop).ok(); });
        self.threads.drain(..)
            .for_each(|th| { th.join().ok(); });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_order_is_preserved() {
        let pool: ContractorPool<f64> = ContractorPool::new(4);
        let jobs: Vec<(nd::Array2<f64>, nd::Array2<f64>)> =
            (0..16)
            .map(|k| {
                let lhs = nd::Array2::from_elem((2, 2), k as f64);
                let rhs = nd::Array2::eye(2);
                (lhs, rhs)
            })
            .collect();
        let out = pool.run(2.0, jobs).unwrap();
        assert_eq!(out.len(), 16);
        for (k, mat) in out.iter().enumerate() {
            assert_eq!(mat[[0, 0]], 2.0 * k as f64);
            assert_eq!(mat[[1, 1]], 2.0 * k as f64);
        }
    }

    #[test]
    fn empty_batch() {
        let pool: ContractorPool<f64> = ContractorPool::new(2);
        let out = pool.run(1.0, Vec::new()).unwrap();
        assert!(out.is_empty());
    }
}
