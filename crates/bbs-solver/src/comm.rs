//! Process-group abstraction used by every distributed component.
//!
//! A partition only talks to the others through the collectives defined
//! here. The only primitive a transport must provide is an all-gather of
//! type-erased messages; sums, scans, maxima, all-to-all exchanges and
//! owner request/response rounds are derived from it in [`CommunicatorExt`].
//!
//! Every collective is a synchronous barrier: a partition does not return
//! from it before all partitions have contributed.

use crate::error::{BuilderError, Result};
use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

/// Index of a partition inside its process group.
pub type Rank = usize;

/// Type-erased payload of a collective exchange.
pub type Message = Arc<dyn Any + Send + Sync>;

/// Transport collaborator injected into the builder.
pub trait Communicator: Send + Sync {
    /// Rank of the calling partition.
    fn rank(&self) -> Rank;

    /// Number of partitions in the group.
    fn size(&self) -> usize;

    /// Contribute `message` and receive the contributions of every rank,
    /// indexed by rank.
    fn all_gather_message(&self, message: Message) -> Result<Vec<Message>>;
}

/// Typed collectives built on top of [`Communicator::all_gather_message`].
pub trait CommunicatorExt: Communicator {
    fn all_gather<T>(&self, value: T) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.all_gather_message(Arc::new(value))?
            .into_iter()
            .enumerate()
            .map(|(rank, message)| {
                (*message).downcast_ref::<T>().cloned().ok_or_else(|| {
                    BuilderError::Collective(format!(
                        "rank {rank} contributed a message of an unexpected type"
                    ))
                })
            })
            .collect()
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather(()).map(|_| ())
    }

    fn sum_all(&self, value: usize) -> Result<usize> {
        Ok(self.all_gather(value)?.into_iter().sum())
    }

    /// Exclusive prefix sum: the sum of `value` over all lower ranks.
    fn scan_sum(&self, value: usize) -> Result<usize> {
        let rank = self.rank();
        Ok(self.all_gather(value)?.into_iter().take(rank).sum())
    }

    /// Sum in rank order, so every partition gets the same bits.
    fn sum_all_f64(&self, value: f64) -> Result<f64> {
        Ok(self.all_gather(value)?.into_iter().fold(0.0, |acc, v| acc + v))
    }

    fn max_all_f64(&self, value: f64) -> Result<f64> {
        Ok(self
            .all_gather(value)?
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max))
    }

    /// Personalised exchange: `sends[r]` goes to rank `r`, the result holds
    /// what every rank sent to the caller, indexed by source rank.
    fn all_to_all<T>(&self, sends: Vec<Vec<T>>) -> Result<Vec<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        if sends.len() != self.size() {
            return Err(BuilderError::Collective(format!(
                "all_to_all expects {} send buffers, got {}",
                self.size(),
                sends.len()
            )));
        }
        let me = self.rank();
        self.all_gather_message(Arc::new(sends))?
            .iter()
            .enumerate()
            .map(|(source, message)| {
                (**message)
                    .downcast_ref::<Vec<Vec<T>>>()
                    .and_then(|table| table.get(me).cloned())
                    .ok_or_else(|| {
                        BuilderError::Collective(format!(
                            "rank {source} sent a malformed all_to_all table"
                        ))
                    })
            })
            .collect()
    }

    /// Two-phase exchange: send `requests[r]` to rank `r`, let every rank
    /// answer each request with `answer`, and return the answers in request
    /// order, grouped by the rank that answered them.
    fn request_response<Q, A, F>(&self, requests: Vec<Vec<Q>>, answer: F) -> Result<Vec<Vec<A>>>
    where
        Q: Clone + Send + Sync + 'static,
        A: Clone + Send + Sync + 'static,
        F: Fn(&Q) -> Result<A>,
    {
        let incoming = self.all_to_all(requests)?;
        let replies = incoming
            .iter()
            .map(|queries| queries.iter().map(&answer).collect::<Result<Vec<A>>>())
            .collect::<Result<Vec<_>>>();
        let replies = self.agree(replies)?;
        self.all_to_all(replies)
    }

    /// Collective agreement on a local outcome. When any partition failed,
    /// every partition returns an error: its own, or `RemoteFailure`.
    fn agree<T>(&self, local: Result<T>) -> Result<T> {
        let failed = self.sum_all(usize::from(local.is_err()))?;
        match local {
            Ok(_) if failed > 0 => Err(BuilderError::RemoteFailure { failed }),
            outcome => outcome,
        }
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// Single-partition group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_message(&self, message: Message) -> Result<Vec<Message>> {
        Ok(vec![message])
    }
}

struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Message>>>,
}

/// In-process group where every partition runs on its own thread.
#[derive(Clone)]
pub struct ThreadCommunicator {
    rank: Rank,
    size: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadCommunicator {
    /// Create the `size` endpoints of a new group.
    pub fn group(size: usize) -> Vec<Self> {
        let shared = Arc::new(Rendezvous {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Run `task` once per partition on scoped threads and collect the
    /// results in rank order.
    pub fn run<R, F>(size: usize, task: F) -> Vec<R>
    where
        F: Fn(Arc<dyn Communicator>) -> R + Sync,
        R: Send,
    {
        let group = Self::group(size);
        std::thread::scope(|scope| {
            let task = &task;
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| scope.spawn(move || task(Arc::new(comm))))
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_message(&self, message: Message) -> Result<Vec<Message>> {
        let poisoned = |_| BuilderError::Collective("process group mutex poisoned".to_string());

        self.shared.slots.lock().map_err(poisoned)?[self.rank] = Some(message);
        self.shared.barrier.wait();

        let gathered = self.shared.slots.lock().map_err(poisoned).and_then(|slots| {
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        BuilderError::Collective(format!("rank {rank} did not contribute"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        });

        // Nobody may overwrite a slot before every rank has read all of them.
        self.shared.barrier.wait();
        gathered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_collectives_are_identities() {
        let comm = SerialCommunicator;
        assert_eq!(comm.sum_all(7).unwrap(), 7);
        assert_eq!(comm.scan_sum(7).unwrap(), 0);
        assert_eq!(comm.max_all_f64(-2.5).unwrap(), -2.5);
        let received = comm.all_to_all(vec![vec![1, 2, 3]]).unwrap();
        assert_eq!(received, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn thread_group_scan_and_sum() {
        let results = ThreadCommunicator::run(4, |comm| {
            let local = comm.rank() + 1;
            (comm.scan_sum(local).unwrap(), comm.sum_all(local).unwrap())
        });
        assert_eq!(results, vec![(0, 10), (1, 10), (3, 10), (6, 10)]);
    }

    #[test]
    fn thread_group_all_to_all_routes_by_rank() {
        let results = ThreadCommunicator::run(3, |comm| {
            let me = comm.rank();
            let sends = (0..comm.size()).map(|dest| vec![(me, dest)]).collect();
            comm.all_to_all(sends).unwrap()
        });
        for (me, received) in results.iter().enumerate() {
            for (source, payload) in received.iter().enumerate() {
                assert_eq!(payload, &vec![(source, me)]);
            }
        }
    }

    #[test]
    fn request_response_answers_in_request_order() {
        let results = ThreadCommunicator::run(2, |comm| {
            let other = 1 - comm.rank();
            let mut requests = vec![Vec::new(); 2];
            requests[other] = vec![3usize, 1, 2];
            let base = comm.rank() * 100;
            comm.request_response(requests, |q| Ok(base + *q)).unwrap()
        });
        assert_eq!(results[0][1], vec![103, 101, 102]);
        assert_eq!(results[1][0], vec![3, 1, 2]);
    }

    #[test]
    fn agree_reports_remote_failures() {
        let results = ThreadCommunicator::run(2, |comm| {
            let local: Result<()> = if comm.rank() == 0 {
                Err(BuilderError::NoDegreesOfFreedom)
            } else {
                Ok(())
            };
            comm.agree(local)
        });
        assert!(matches!(results[0], Err(BuilderError::NoDegreesOfFreedom)));
        assert!(matches!(
            results[1],
            Err(BuilderError::RemoteFailure { failed: 1 })
        ));
    }
}
