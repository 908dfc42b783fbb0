use crate::error::Error;
use anyhow::{Result, bail};
use candle_core::Device;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How the members that share one device are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// All members of a shard run concurrently.
    #[default]
    Vectorized,
    /// Members of a shard run one after the other.
    Sequential,
}

impl ExecutionStrategy {
    pub fn from_parallel(parallel: bool) -> Self {
        if parallel {
            Self::Vectorized
        } else {
            Self::Sequential
        }
    }
}

/// A flat mesh of devices with a single population axis. Member `i` of a population of size `P`
/// lives on shard `i / (P / num_devices)`.
#[derive(Debug, Clone)]
pub struct DeviceMesh {
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            bail!(Error::unsupported("devices", "empty device list"));
        }
        Ok(Self { devices })
    }

    /// `num_shards` logical shards backed by the host.
    pub fn cpu(num_shards: usize) -> Self {
        Self {
            devices: vec![Device::Cpu; num_shards.max(1)],
        }
    }

    /// Parses `cpu`, `cpu:N` or `cuda:I,J,...`.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let (kind, rest) = match spec.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (spec, None),
        };
        match (kind, rest) {
            ("cpu", None) => Ok(Self::cpu(1)),
            ("cpu", Some(n)) => match n.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Self::cpu(n)),
                _ => bail!(Error::unsupported("devices", spec)),
            },
            ("cuda", Some(ordinals)) => {
                let mut devices = vec![];
                for ordinal in ordinals.split(',') {
                    let Ok(ordinal) = ordinal.trim().parse::<usize>() else {
                        bail!(Error::unsupported("devices", spec));
                    };
                    devices.push(Device::new_cuda(ordinal)?);
                }
                Self::new(devices)
            }
            _ => bail!(Error::unsupported("devices", spec)),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, shard: usize) -> &Device {
        &self.devices[shard % self.devices.len()]
    }

    /// Truncates `size` to the nearest multiple of the device count, warning when that drops
    /// members. Fewer items than devices is an error, some shard would be left empty.
    pub fn rescale(&self, what: &str, size: usize) -> Result<usize> {
        let num_devices = self.len();
        if size < num_devices {
            bail!(Error::unsupported(
                what,
                format!("{size}, fewer than the {num_devices} devices")
            ));
        }
        let rescaled = size / num_devices * num_devices;
        if rescaled != size {
            warn!(
                "{what} ({size}) is not a multiple of the number of devices ({num_devices}), \
                 using {rescaled} instead"
            );
        }
        Ok(rescaled)
    }

    /// Shard index and device of every member of a population of `size`.
    pub fn placement(&self, size: usize) -> Vec<(usize, Device)> {
        let per_shard = (size / self.len()).max(1);
        (0..size)
            .map(|i| {
                let shard = (i / per_shard).min(self.len() - 1);
                (shard, self.devices[shard].clone())
            })
            .collect()
    }

    /// Runs `f(member_index, item, device)` for every item, each shard on its own thread, and
    /// returns the results in member order. Blocks until every shard is done; the first error
    /// wins.
    pub fn map<T, R, F>(&self, items: Vec<T>, strategy: ExecutionStrategy, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(usize, T, &Device) -> Result<R> + Sync,
    {
        let size = items.len();
        if size == 0 {
            return Ok(vec![]);
        }
        let per_shard = size.div_ceil(self.len());
        let mut shards: Vec<Vec<(usize, T)>> = vec![];
        let mut items = items.into_iter().enumerate().peekable();
        while items.peek().is_some() {
            shards.push(items.by_ref().take(per_shard).collect());
        }

        let f = &f;
        let shard_results = crossbeam::scope(|s| {
            let handles: Vec<_> = shards
                .into_iter()
                .enumerate()
                .map(|(shard, members)| {
                    let device = &self.devices[shard];
                    s.spawn(move |_| -> Result<Vec<R>> {
                        match strategy {
                            ExecutionStrategy::Vectorized => members
                                .into_par_iter()
                                .map(|(i, item)| f(i, item, device))
                                .collect(),
                            ExecutionStrategy::Sequential => members
                                .into_iter()
                                .map(|(i, item)| f(i, item, device))
                                .collect(),
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(shard, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::ShardPanicked(shard).into()))
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| Error::ShardPanicked(0))?;

        let mut out = Vec::with_capacity(size);
        for shard in shard_results {
            out.extend(shard?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::{DeviceMesh, ExecutionStrategy};
    use crate::error::Error;
    use anyhow::{Result, bail};

    #[test]
    fn rescale_truncates_to_multiple() -> Result<()> {
        let mesh = DeviceMesh::cpu(4);
        assert_eq!(mesh.rescale("pop_size", 10)?, 8);
        assert_eq!(mesh.rescale("pop_size", 8)?, 8);
        assert_eq!(mesh.rescale("pop_size", 4)?, 4);
        Ok(())
    }

    #[test]
    fn rescale_never_grows() {
        let mesh = DeviceMesh::cpu(4);
        for size in [0, 3] {
            let err = mesh.rescale("pop_size", size).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::UnsupportedConfig { key, .. }) if key == "pop_size"
            ));
        }
    }

    #[test]
    fn device_string_parsing() -> Result<()> {
        assert_eq!(DeviceMesh::from_spec("cpu")?.len(), 1);
        assert_eq!(DeviceMesh::from_spec("cpu:3")?.len(), 3);
        for bad in ["tpu", "cpu:0", "cpu:x", "cuda"] {
            let err = DeviceMesh::from_spec(bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::UnsupportedConfig { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn both_strategies_keep_member_order() -> Result<()> {
        let mesh = DeviceMesh::cpu(2);
        let items: Vec<usize> = (0..6).collect();
        for strategy in [ExecutionStrategy::Vectorized, ExecutionStrategy::Sequential] {
            let out = mesh.map(items.clone(), strategy, |i, item, _| Ok((i, item * 10)))?;
            assert_eq!(out, (0..6).map(|i| (i, i * 10)).collect::<Vec<_>>());
        }
        Ok(())
    }

    #[test]
    fn member_failure_fails_the_step() {
        let mesh = DeviceMesh::cpu(2);
        let res = mesh.map(vec![0, 1, 2, 3], ExecutionStrategy::Sequential, |i, _, _| {
            if i == 3 {
                bail!(Error::IndexOutOfRange { index: i, len: 3 })
            }
            Ok(i)
        });
        assert!(res.is_err());
    }
}
