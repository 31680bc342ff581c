//! Collective communication between the per-device workers of one host.
//!
//! Ranks meet at a [`Rendezvous`]: rank 0 owns the listening socket, every
//! other rank connects to it and announces itself. The resulting star of TCP
//! links either carries the reductions itself ([`CollectiveBackend::HostStaged`])
//! or only hands out the NCCL unique id ([`CollectiveBackend::Nccl`]).
//!
//! Every rank must issue the same collectives in the same order. The
//! host-staged backend checks buffer sizes on the leader and fails with
//! [`CollectiveError::Desync`] instead of hanging when they disagree.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;
use tracing::{debug, trace};

pub const DEFAULT_RENDEZVOUS: &str = "127.0.0.1:25565";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceType {
    Sum,
    Max,
    Mean,
}

/// How gradients travel between devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectiveBackend {
    /// Copy to host memory and reduce over loopback TCP. Needs no
    /// device-to-device transport.
    HostStaged,
    /// NCCL over native device transport.
    Nccl,
}

impl fmt::Display for CollectiveBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveBackend::HostStaged => write!(f, "host-staged"),
            CollectiveBackend::Nccl => write!(f, "nccl"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Linux,
    Unsupported(&'static str),
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostPlatform::Windows
        } else if cfg!(target_os = "linux") {
            HostPlatform::Linux
        } else {
            HostPlatform::Unsupported(std::env::consts::OS)
        }
    }

    /// The transport this platform trains with, or `None` when it can't.
    pub fn preferred_backend(&self) -> Option<CollectiveBackend> {
        match self {
            HostPlatform::Windows => Some(CollectiveBackend::HostStaged),
            HostPlatform::Linux if cfg!(feature = "nccl") => Some(CollectiveBackend::Nccl),
            HostPlatform::Linux => Some(CollectiveBackend::HostStaged),
            HostPlatform::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPlatform::Windows => write!(f, "windows"),
            HostPlatform::Linux => write!(f, "linux"),
            HostPlatform::Unsupported(os) => write!(f, "{os}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("failed to bind rendezvous at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("rank {rank} could not reach the rendezvous at {addr} within {waited:?}")]
    Timeout {
        rank: usize,
        addr: SocketAddr,
        waited: Duration,
    },

    #[error("rendezvous handshake failed: {0}")]
    Handshake(String),

    #[error("collective I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("rank {rank} sent {found} values, expected {expected}: ranks issued different collectives")]
    Desync {
        rank: usize,
        expected: usize,
        found: usize,
    },

    #[error("tensor staging failed: {0}")]
    Tensor(#[from] TchError),

    #[error("{0} backend is not available in this build")]
    BackendUnavailable(CollectiveBackend),

    #[cfg(feature = "nccl")]
    #[error("nccl: {0}")]
    Nccl(String),
}

/// The meeting point for one job, bound before any worker starts.
#[derive(Debug)]
pub struct Rendezvous {
    listener: TcpListener,
    addr: SocketAddr,
    world_size: usize,
    timeout: Duration,
}

impl Rendezvous {
    pub fn bind(addr: impl ToSocketAddrs + fmt::Display, world_size: usize) -> Result<Self, CollectiveError> {
        let listener = TcpListener::bind(&addr).map_err(|source| CollectiveError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            world_size,
            timeout: CONNECT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// One endpoint per rank, in rank order. Rank 0's endpoint carries the
    /// listening socket.
    pub fn into_endpoints(self) -> Vec<Endpoint> {
        let mut listener = Some(self.listener);
        (0..self.world_size)
            .map(|rank| Endpoint {
                rank,
                world_size: self.world_size,
                addr: self.addr,
                timeout: self.timeout,
                listener: if rank == 0 { listener.take() } else { None },
            })
            .collect()
    }
}

/// What one worker needs to join the group.
#[derive(Debug)]
pub struct Endpoint {
    rank: usize,
    world_size: usize,
    addr: SocketAddr,
    timeout: Duration,
    listener: Option<TcpListener>,
}

impl Endpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

enum Links {
    /// Stream `i` leads to rank `i + 1`.
    Leader(Vec<TcpStream>),
    Peer(TcpStream),
}

/// TCP star between rank 0 and every other rank.
pub struct HostStagedGroup {
    rank: usize,
    world_size: usize,
    links: Links,
}

impl fmt::Debug for HostStagedGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStagedGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl HostStagedGroup {
    pub fn connect(endpoint: Endpoint) -> Result<Self, CollectiveError> {
        let Endpoint {
            rank,
            world_size,
            addr,
            timeout,
            listener,
        } = endpoint;
        let links = match listener {
            Some(listener) => Links::Leader(accept_peers(&listener, world_size, timeout)?),
            None => Links::Peer(connect_to_leader(addr, rank, timeout)?),
        };
        debug!(rank, world_size, "Joined collective group");
        Ok(Self {
            rank,
            world_size,
            links,
        })
    }

    fn all_reduce(&self, buf: &mut [f32], op: ReduceType) -> Result<(), CollectiveError> {
        match &self.links {
            Links::Peer(leader) => {
                send_frame(leader, buf)?;
                let reduced = recv_frame(leader)?;
                if reduced.len() != buf.len() {
                    return Err(CollectiveError::Desync {
                        rank: 0,
                        expected: buf.len(),
                        found: reduced.len(),
                    });
                }
                buf.copy_from_slice(&reduced);
            }
            Links::Leader(peers) => {
                for (i, peer) in peers.iter().enumerate() {
                    let incoming = recv_frame(peer)?;
                    if incoming.len() != buf.len() {
                        return Err(CollectiveError::Desync {
                            rank: i + 1,
                            expected: buf.len(),
                            found: incoming.len(),
                        });
                    }
                    match op {
                        ReduceType::Sum | ReduceType::Mean => {
                            buf.iter_mut().zip(&incoming).for_each(|(a, b)| *a += b)
                        }
                        ReduceType::Max => {
                            buf.iter_mut().zip(&incoming).for_each(|(a, b)| *a = a.max(*b))
                        }
                    }
                }
                if op == ReduceType::Mean {
                    let n = self.world_size as f32;
                    buf.iter_mut().for_each(|v| *v /= n);
                }
                for peer in peers {
                    send_frame(peer, buf)?;
                }
            }
        }
        trace!(rank = self.rank, len = buf.len(), ?op, "all-reduce");
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        match &self.links {
            Links::Peer(leader) if self.rank == root => send_frame(leader, buf)?,
            Links::Peer(leader) => {
                let incoming = recv_frame(leader)?;
                if incoming.len() != buf.len() {
                    return Err(CollectiveError::Desync {
                        rank: 0,
                        expected: buf.len(),
                        found: incoming.len(),
                    });
                }
                buf.copy_from_slice(&incoming);
            }
            Links::Leader(peers) => {
                if root != 0 {
                    let incoming = recv_frame(&peers[root - 1])?;
                    if incoming.len() != buf.len() {
                        return Err(CollectiveError::Desync {
                            rank: root,
                            expected: buf.len(),
                            found: incoming.len(),
                        });
                    }
                    buf.copy_from_slice(&incoming);
                }
                for (i, peer) in peers.iter().enumerate() {
                    if i + 1 != root {
                        send_frame(peer, buf)?;
                    }
                }
            }
        }
        trace!(rank = self.rank, len = buf.len(), root, "broadcast");
        Ok(())
    }

    #[cfg(feature = "nccl")]
    fn share_bytes(&self, bytes: &mut [u8]) -> Result<(), CollectiveError> {
        match &self.links {
            Links::Leader(peers) => {
                for mut peer in peers {
                    peer.write_all(bytes)?;
                }
            }
            Links::Peer(leader) => {
                let mut leader: &TcpStream = leader;
                leader.read_exact(bytes)?;
            }
        }
        Ok(())
    }
}

fn accept_peers(
    listener: &TcpListener,
    world_size: usize,
    timeout: Duration,
) -> Result<Vec<TcpStream>, CollectiveError> {
    let deadline = Instant::now() + timeout;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                let mut rank = [0u8; 4];
                stream.read_exact(&mut rank)?;
                let rank = u32::from_le_bytes(rank) as usize;
                let slot = rank
                    .checked_sub(1)
                    .and_then(|i| slots.get_mut(i))
                    .ok_or_else(|| CollectiveError::Handshake(format!("unexpected rank {rank}")))?;
                if slot.replace(stream).is_some() {
                    return Err(CollectiveError::Handshake(format!("rank {rank} joined twice")));
                }
                joined += 1;
                trace!(rank, "peer joined rendezvous");
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CollectiveError::Timeout {
                        rank: 0,
                        addr,
                        waited: timeout,
                    });
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_leader(
    addr: SocketAddr,
    rank: usize,
    timeout: Duration,
) -> Result<TcpStream, CollectiveError> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                stream.set_nodelay(true)?;
                stream.write_all(&(rank as u32).to_le_bytes())?;
                return Ok(stream);
            }
            Err(_) if Instant::now() < deadline => thread::sleep(RETRY_INTERVAL),
            Err(_) => {
                return Err(CollectiveError::Timeout {
                    rank,
                    addr,
                    waited: timeout,
                })
            }
        }
    }
}

fn send_frame(mut stream: &TcpStream, data: &[f32]) -> io::Result<()> {
    stream.write_all(&(data.len() as u64).to_le_bytes())?;
    stream.write_all(bytemuck::cast_slice(data))?;
    stream.flush()
}

fn recv_frame(mut stream: &TcpStream) -> io::Result<Vec<f32>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;
    let mut bytes = vec![0u8; len * std::mem::size_of::<f32>()];
    stream.read_exact(&mut bytes)?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

#[cfg(feature = "nccl")]
pub use nccl::NcclGroup;

#[cfg(feature = "nccl")]
mod nccl {
    use std::sync::Arc;

    use cudarc::{
        driver::CudaDevice,
        nccl::safe::{Comm, Id, ReduceOp},
    };

    use super::{CollectiveError, HostStagedGroup, ReduceType};

    fn nccl_err(err: impl std::fmt::Debug) -> CollectiveError {
        CollectiveError::Nccl(format!("{err:?}"))
    }

    /// NCCL communicator for one CUDA device. Buffers are staged through
    /// cudarc allocations since tch and cudarc don't share them.
    pub struct NcclGroup {
        comm: Comm,
        device: Arc<CudaDevice>,
    }

    impl std::fmt::Debug for NcclGroup {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("NcclGroup")
                .field("rank", &self.comm.rank())
                .field("world_size", &self.comm.world_size())
                .finish()
        }
    }

    impl NcclGroup {
        pub(super) fn new(links: &HostStagedGroup, ordinal: usize) -> Result<Self, CollectiveError> {
            let mut bytes = [0u8; 128];
            if links.rank == 0 {
                let id = Id::new().map_err(nccl_err)?;
                for (dst, src) in bytes.iter_mut().zip(id.internal()) {
                    *dst = *src as u8;
                }
            }
            links.share_bytes(&mut bytes)?;
            let id = Id::uninit(bytes.map(|b| b as _));
            let device = CudaDevice::new(ordinal).map_err(nccl_err)?;
            let comm = Comm::from_rank(device.clone(), links.rank, links.world_size, id)
                .map_err(nccl_err)?;
            Ok(Self { comm, device })
        }

        pub(super) fn all_reduce(&self, buf: &mut [f32], op: ReduceType) -> Result<(), CollectiveError> {
            let op = match op {
                ReduceType::Sum => ReduceOp::Sum,
                ReduceType::Max => ReduceOp::Max,
                ReduceType::Mean => ReduceOp::Avg,
            };
            let send = self.device.htod_sync_copy(buf).map_err(nccl_err)?;
            let mut recv = self.device.alloc_zeros::<f32>(buf.len()).map_err(nccl_err)?;
            self.comm.all_reduce(&send, &mut recv, &op).map_err(nccl_err)?;
            let out = self.device.dtoh_sync_copy(&recv).map_err(nccl_err)?;
            buf.copy_from_slice(&out);
            Ok(())
        }

        pub(super) fn broadcast(&self, buf: &mut [f32], root: usize) -> Result<(), CollectiveError> {
            let send = if self.comm.rank() == root {
                Some(self.device.htod_sync_copy(buf).map_err(nccl_err)?)
            } else {
                None
            };
            let mut recv = self.device.alloc_zeros::<f32>(buf.len()).map_err(nccl_err)?;
            self.comm
                .broadcast(&send, &mut recv, root as i32)
                .map_err(nccl_err)?;
            let out = self.device.dtoh_sync_copy(&recv).map_err(nccl_err)?;
            buf.copy_from_slice(&out);
            Ok(())
        }

        pub(super) fn rank(&self) -> usize {
            self.comm.rank()
        }

        pub(super) fn world_size(&self) -> usize {
            self.comm.world_size()
        }
    }
}

/// This rank's handle on the group.
#[derive(Debug)]
pub enum Communicator {
    /// A group of one; every collective is the identity.
    Solo,
    HostStaged(HostStagedGroup),
    #[cfg(feature = "nccl")]
    Nccl(NcclGroup),
}

impl Communicator {
    pub fn solo() -> Self {
        Self::Solo
    }

    /// Joins the group through `endpoint` with the chosen transport.
    #[allow(unused_variables)]
    pub fn connect(
        endpoint: Endpoint,
        backend: CollectiveBackend,
        device: Device,
    ) -> Result<Self, CollectiveError> {
        if endpoint.world_size <= 1 {
            return Ok(Self::Solo);
        }
        let links = HostStagedGroup::connect(endpoint)?;
        match (backend, device) {
            (CollectiveBackend::HostStaged, _) => Ok(Self::HostStaged(links)),
            #[cfg(feature = "nccl")]
            (CollectiveBackend::Nccl, Device::Cuda(ordinal)) => {
                Ok(Self::Nccl(NcclGroup::new(&links, ordinal)?))
            }
            (CollectiveBackend::Nccl, _) => Err(CollectiveError::BackendUnavailable(backend)),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            Communicator::Solo => 0,
            Communicator::HostStaged(group) => group.rank,
            #[cfg(feature = "nccl")]
            Communicator::Nccl(group) => group.rank(),
        }
    }

    pub fn world_size(&self) -> usize {
        match self {
            Communicator::Solo => 1,
            Communicator::HostStaged(group) => group.world_size,
            #[cfg(feature = "nccl")]
            Communicator::Nccl(group) => group.world_size(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.rank() == 0
    }

    /// Reduces `tensors` element-wise across ranks and writes the result
    /// back into every rank's tensors.
    pub fn all_reduce(&self, tensors: &[Tensor], op: ReduceType) -> Result<(), CollectiveError> {
        if matches!(self, Communicator::Solo) {
            return Ok(());
        }
        let mut buf = flatten(tensors)?;
        match self {
            Communicator::Solo => {}
            Communicator::HostStaged(group) => group.all_reduce(&mut buf, op)?,
            #[cfg(feature = "nccl")]
            Communicator::Nccl(group) => group.all_reduce(&mut buf, op)?,
        }
        unflatten_into(tensors, &buf)
    }

    /// Overwrites `tensors` on every rank with `root`'s values.
    pub fn broadcast(&self, tensors: &[Tensor], root: usize) -> Result<(), CollectiveError> {
        if matches!(self, Communicator::Solo) {
            return Ok(());
        }
        let mut buf = flatten(tensors)?;
        match self {
            Communicator::Solo => {}
            Communicator::HostStaged(group) => group.broadcast(&mut buf, root)?,
            #[cfg(feature = "nccl")]
            Communicator::Nccl(group) => group.broadcast(&mut buf, root)?,
        }
        unflatten_into(tensors, &buf)
    }

    pub fn all_reduce_scalar(&self, value: f64, op: ReduceType) -> Result<f64, CollectiveError> {
        let t = Tensor::from_slice(&[value as f32]);
        self.all_reduce(std::slice::from_ref(&t), op)?;
        Ok(t.double_value(&[0]))
    }

    pub fn barrier(&self) -> Result<(), CollectiveError> {
        self.all_reduce_scalar(0.0, ReduceType::Sum).map(|_| ())
    }
}

fn flatten(tensors: &[Tensor]) -> Result<Vec<f32>, CollectiveError> {
    if tensors.is_empty() {
        return Ok(Vec::new());
    }
    let _guard = tch::no_grad_guard();
    let parts: Vec<Tensor> = tensors
        .iter()
        .map(|t| t.detach().to_kind(Kind::Float).to_device(Device::Cpu).reshape([-1]))
        .collect();
    Ok(Vec::<f32>::try_from(&Tensor::cat(&parts, 0))?)
}

fn unflatten_into(tensors: &[Tensor], buf: &[f32]) -> Result<(), CollectiveError> {
    let _guard = tch::no_grad_guard();
    let mut offset = 0;
    for tensor in tensors {
        let n = tensor.numel();
        let src = Tensor::from_slice(&buf[offset..offset + n])
            .view(tensor.size().as_slice())
            .to_kind(tensor.kind())
            .to_device(tensor.device());
        tensor.shallow_clone().f_copy_(&src)?;
        offset += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(Communicator) -> T + Send + Sync + Clone + 'static,
    {
        let rendezvous = Rendezvous::bind("127.0.0.1:0", world_size)
            .unwrap()
            .with_timeout(Duration::from_secs(10));
        let handles: Vec<_> = rendezvous
            .into_endpoints()
            .into_iter()
            .map(|endpoint| {
                let f = f.clone();
                thread::spawn(move || {
                    let comm = Communicator::connect(
                        endpoint,
                        CollectiveBackend::HostStaged,
                        Device::Cpu,
                    )
                    .unwrap();
                    f(comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce_sum_mean_max() {
        let results = run_group(3, |comm| {
            let rank = comm.rank() as f32;
            let a = Tensor::from_slice(&[rank, 1.0]);
            let b = Tensor::from_slice(&[rank * 2.0, -rank, 0.5, 3.0]).view([2, 2]);
            comm.all_reduce(&[a.shallow_clone(), b.shallow_clone()], ReduceType::Sum)
                .unwrap();
            let mean = Tensor::from_slice(&[rank]);
            comm.all_reduce(std::slice::from_ref(&mean), ReduceType::Mean)
                .unwrap();
            let max = comm.all_reduce_scalar(rank as f64, ReduceType::Max).unwrap();
            (
                Vec::<f32>::try_from(&a).unwrap(),
                Vec::<f32>::try_from(&b.flatten(0, -1)).unwrap(),
                mean.double_value(&[0]),
                max,
            )
        });
        for (a, b, mean, max) in results {
            assert_eq!(a, vec![3.0, 3.0]);
            assert_eq!(b, vec![6.0, -3.0, 1.5, 9.0]);
            assert_eq!(mean, 1.0);
            assert_eq!(max, 2.0);
        }
    }

    #[test]
    fn broadcast_from_non_leader_root() {
        let results = run_group(3, |comm| {
            let t = Tensor::from_slice(&[comm.rank() as f32; 3]);
            comm.broadcast(std::slice::from_ref(&t), 2).unwrap();
            comm.barrier().unwrap();
            Vec::<f32>::try_from(&t).unwrap()
        });
        assert_eq!(results, vec![vec![2.0; 3]; 3]);
    }

    #[test]
    fn mismatched_collectives_fail_instead_of_hanging() {
        let results = run_group(2, |comm| {
            let len = if comm.rank() == 0 { 2 } else { 3 };
            let t = Tensor::zeros([len], (Kind::Float, Device::Cpu));
            comm.all_reduce(&[t], ReduceType::Sum).is_err()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn solo_is_identity() {
        let comm = Communicator::solo();
        let t = Tensor::from_slice(&[1.0f32, 2.0]);
        comm.all_reduce(std::slice::from_ref(&t), ReduceType::Mean)
            .unwrap();
        comm.broadcast(std::slice::from_ref(&t), 0).unwrap();
        assert_eq!(Vec::<f32>::try_from(&t).unwrap(), vec![1.0, 2.0]);
        assert_eq!((comm.rank(), comm.world_size()), (0, 1));
    }

    #[test]
    fn platform_maps_to_backend() {
        assert_eq!(
            HostPlatform::Windows.preferred_backend(),
            Some(CollectiveBackend::HostStaged)
        );
        assert_eq!(HostPlatform::Unsupported("macos").preferred_backend(), None);
        let linux = HostPlatform::Linux.preferred_backend();
        if cfg!(feature = "nccl") {
            assert_eq!(linux, Some(CollectiveBackend::Nccl));
        } else {
            assert_eq!(linux, Some(CollectiveBackend::HostStaged));
        }
    }
}
