//! Spawns one worker per device and joins them into a collective group.

use std::{thread, time::Duration};

use tch::Device;
use thiserror::Error;
use tracing::{debug, info, warn};
use vits_modeling::{
    CollectiveBackend, CollectiveError, Communicator, Devices, HostPlatform, Rendezvous,
    DEFAULT_RENDEZVOUS,
};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("training is not supported on {0}")]
    PlatformUnsupported(HostPlatform),

    #[error("no device to train on")]
    NoDevices,

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error("rank {rank} failed: {error:#}")]
    Worker { rank: usize, error: anyhow::Error },

    #[error("rank {0} panicked")]
    WorkerPanicked(usize),
}

/// Everything a worker owns. Built once per rank, inside the rank's thread.
#[derive(Debug)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
    pub backend: CollectiveBackend,
    pub comm: Communicator,
    pub seed: u64,
}

impl WorkerContext {
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }
}

#[derive(Debug, Clone)]
pub struct ProcessGroupBootstrap {
    platform: HostPlatform,
    devices: Vec<Device>,
    rendezvous: String,
    timeout: Option<Duration>,
    seed: u64,
}

impl ProcessGroupBootstrap {
    /// One rank per selected device.
    pub fn new(devices: &Devices, seed: u64) -> Self {
        let devices = (0..devices.size())
            .map_while(|rank| devices.device_for_rank(rank))
            .collect();
        Self::from_devices(devices, seed)
    }

    /// Explicit rank to device mapping. Several ranks may share a device.
    pub fn from_devices(devices: Vec<Device>, seed: u64) -> Self {
        Self {
            platform: HostPlatform::current(),
            devices,
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            timeout: None,
            seed,
        }
    }

    pub fn with_rendezvous(mut self, addr: impl Into<String>) -> Self {
        self.rendezvous = addr.into();
        self
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn world_size(&self) -> usize {
        self.devices.len()
    }

    pub fn backend(&self) -> Result<CollectiveBackend, BootstrapError> {
        self.platform
            .preferred_backend()
            .ok_or(BootstrapError::PlatformUnsupported(self.platform))
    }

    /// Runs `worker` on every rank and returns their results in rank order.
    ///
    /// An unsupported platform or an empty device list fails before any
    /// thread starts or any device is touched. A failing rank drops its links,
    /// which makes the collectives of every other rank fail too.
    pub fn launch<T, F>(self, worker: F) -> Result<Vec<T>, BootstrapError>
    where
        T: Send + 'static,
        F: Fn(WorkerContext) -> anyhow::Result<T> + Send + Sync + Clone + 'static,
    {
        let backend = self.backend()?;
        if self.devices.is_empty() {
            return Err(BootstrapError::NoDevices);
        }
        let world_size = self.devices.len();
        if self.devices.iter().any(|d| *d == Device::Cpu) {
            warn!("Training on the CPU. This is only meant for debugging.");
        }

        let mut endpoints = if world_size > 1 {
            let mut rendezvous = Rendezvous::bind(self.rendezvous.as_str(), world_size)?;
            if let Some(timeout) = self.timeout {
                rendezvous = rendezvous.with_timeout(timeout);
            }
            info!(addr = %rendezvous.addr(), world_size, %backend, "Rendezvous bound");
            rendezvous.into_endpoints().into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let handles = self
            .devices
            .iter()
            .enumerate()
            .map(|(rank, &device)| {
                let endpoint = endpoints[rank].take();
                let worker = worker.clone();
                let seed = self.seed;
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn(move || -> anyhow::Result<T> {
                        if let Device::Cuda(_) = device {
                            tch::Cuda::cudnn_set_benchmark(true);
                        }
                        // same seed everywhere, so shuffles agree across ranks
                        vits_modeling::set_torch_rng_seed(seed);
                        let comm = match endpoint {
                            Some(endpoint) => Communicator::connect(endpoint, backend, device)?,
                            None => Communicator::solo(),
                        };
                        debug!(rank, ?device, "Worker joined the group");
                        worker(WorkerContext {
                            rank,
                            world_size,
                            device,
                            backend,
                            comm,
                            seed,
                        })
                    })
                    .map_err(|e| BootstrapError::Worker {
                        rank,
                        error: e.into(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = Vec::with_capacity(world_size);
        let mut first_error = None;
        for (rank, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(value)) => results.push(value),
                Ok(Err(error)) => {
                    first_error.get_or_insert(BootstrapError::Worker { rank, error });
                }
                Err(_) => {
                    first_error.get_or_insert(BootstrapError::WorkerPanicked(rank));
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}
