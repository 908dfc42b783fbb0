// In-process collectives for data-parallel replicas. Every replica of a group has to issue the
// same sequence of collective calls; a replica that fails aborts the group so that the others
// return instead of waiting forever.

use crate::{error::Error, tensor::Params};
use anyhow::{Result, bail};
use std::{
    any::Any,
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

type Gathered = Arc<dyn Any + Send + Sync>;

struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Box<dyn Any + Send>>>,
    gathered: Option<Gathered>,
    aborted: bool,
}

struct Shared {
    size: usize,
    round: Mutex<Round>,
    cvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Round> {
        // a panicking replica only poisons the lock, the round itself is still consistent
        self.round.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A group of `size` replicas. Hand one [`Replica`] to each worker.
pub struct ReplicaGroup;

impl ReplicaGroup {
    pub fn new(size: usize) -> Vec<Replica> {
        let shared = Arc::new(Shared {
            size,
            round: Mutex::new(Round {
                generation: 0,
                arrived: 0,
                slots: (0..size).map(|_| None).collect(),
                gathered: None,
                aborted: false,
            }),
            cvar: Condvar::new(),
        });
        (0..size)
            .map(|rank| Replica {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct Replica {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl Replica {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    /// Wakes every replica blocked in a collective; they and all later collectives fail with
    /// [`Error::CollectiveAborted`].
    pub fn abort(&self) {
        self.shared.lock().aborted = true;
        self.shared.cvar.notify_all();
    }

    /// Gathers one value from every replica, ordered by rank.
    pub fn all_gather<T: Clone + Send + Sync + 'static>(&self, value: T) -> Result<Vec<T>> {
        if self.shared.size == 1 {
            return Ok(vec![value]);
        }
        let mut round = self.shared.lock();
        if round.aborted {
            bail!(Error::CollectiveAborted);
        }
        let generation = round.generation;
        round.slots[self.rank] = Some(Box::new(value));
        round.arrived += 1;

        if round.arrived == self.shared.size {
            let values: Option<Vec<T>> = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().and_then(|v| v.downcast::<T>().ok()).map(|v| *v))
                .collect();
            let Some(values) = values else {
                // replicas disagree on the collective being issued
                round.aborted = true;
                self.shared.cvar.notify_all();
                bail!(Error::CollectiveAborted);
            };
            let gathered: Gathered = Arc::new(values.clone());
            round.gathered = Some(gathered);
            round.arrived = 0;
            round.generation += 1;
            self.shared.cvar.notify_all();
            return Ok(values);
        }

        // the next round cannot complete before this replica joins it, so `gathered` still
        // belongs to our generation once it has advanced
        while round.generation == generation && !round.aborted {
            round = self
                .shared
                .cvar
                .wait(round)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if round.generation == generation {
            bail!(Error::CollectiveAborted);
        }
        let Some(gathered) = round.gathered.clone() else {
            bail!(Error::CollectiveAborted);
        };
        drop(round);
        match gathered.downcast::<Vec<T>>() {
            Ok(values) => Ok(values.as_ref().clone()),
            Err(_) => bail!(Error::CollectiveAborted),
        }
    }

    pub fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        Ok(self.all_gather(value)?.iter().sum())
    }

    pub fn all_reduce_mean_scalar(&self, value: f64) -> Result<f64> {
        Ok(self.all_reduce_sum(value)? / self.size() as f64)
    }

    /// Averages named tensors across the group. Contributions are summed in rank order on the
    /// caller's device, so every replica computes a bit-identical result.
    pub fn all_reduce_mean(&self, params: &Params) -> Result<Params> {
        if self.size() == 1 {
            return Ok(params.clone());
        }
        let gathered = self.all_gather(params.0.clone())?;
        let scale = 1. / self.size() as f64;
        let mut out = BTreeMap::new();
        for (name, own) in params.iter() {
            let device = own.device();
            let mut sum = own.zeros_like()?;
            for contribution in gathered.iter() {
                let Some(t) = contribution.get(name) else {
                    bail!(Error::shape("all_reduce_mean", name, "missing entry"));
                };
                sum = sum.add(&t.to_device(device)?)?;
            }
            out.insert(name.clone(), sum.affine(scale, 0.)?);
        }
        Ok(Params(out))
    }
}

#[cfg(test)]
mod test {
    use super::ReplicaGroup;
    use crate::{error::Error, tensor::Params};
    use anyhow::Result;
    use candle_core::{Device, Tensor};

    #[test]
    fn sum_and_mean_across_threads() -> Result<()> {
        let replicas = ReplicaGroup::new(3);
        let results = crossbeam::scope(|s| {
            let handles: Vec<_> = replicas
                .into_iter()
                .map(|replica| {
                    s.spawn(move |_| -> Result<(f64, Vec<f32>)> {
                        let rank = replica.rank() as f32;
                        let mut params = Params::new();
                        params.insert("g".into(), Tensor::new(&[rank, 2. * rank], &Device::Cpu)?);
                        // several rounds back to back
                        let mut total = 0.;
                        for _ in 0..5 {
                            total = replica.all_reduce_sum(replica.rank() as f64 + 1.)?;
                        }
                        let mean = replica.all_reduce_mean(&params)?;
                        Ok((total, mean["g"].to_vec1::<f32>()?))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("replica thread panicked"))
                .collect::<Vec<_>>()
        })
        .expect("scope panicked");
        for res in results {
            let (total, mean) = res?;
            assert_eq!(total, 6.);
            assert_eq!(mean, vec![1., 2.]);
        }
        Ok(())
    }

    #[test]
    fn abort_wakes_waiting_replicas() {
        let mut replicas = ReplicaGroup::new(2);
        let failing = replicas.pop().expect("two replicas");
        let waiting = replicas.pop().expect("two replicas");
        let res = crossbeam::scope(|s| {
            let handle = s.spawn(move |_| waiting.all_reduce_sum(1.));
            failing.abort();
            handle.join().expect("replica thread panicked")
        })
        .expect("scope panicked");
        let err = res.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CollectiveAborted)
        ));
    }
}
