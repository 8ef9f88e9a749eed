//! Fixed worker pool serving one endpoint.
//!
//! Calls travel as JSON bytes over a shared channel; each worker decodes the
//! request, dispatches it through the endpoint's `match`, and sends the
//! encoded reply back on the caller's one-shot channel. The call runs to
//! completion on its worker and may block on nested calls to other nodes.

use crate::client::RpcClient;
use crate::protocol::{
    DataRequest, DataResponse, MetadataRequest, MetadataResponse, RemoteError, Reply,
};
use crate::service::{DataService, MetadataService};
use dfs_error::{DfsError, Result};
use dfs_types::InodeId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

// ── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcServerOptions {
    /// Worker threads. 0 means `min(available_parallelism, 8)`.
    pub worker_threads: usize,
}

impl RpcServerOptions {
    #[must_use]
    pub fn resolved_thread_count(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map_or(1, usize::from)
                .min(8)
        } else {
            self.worker_threads
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads > 1024 {
            return Err(DfsError::InvalidArg(format!(
                "worker_threads {} is unreasonably large",
                self.worker_threads
            )));
        }
        Ok(())
    }
}

// ── Endpoints ───────────────────────────────────────────────────────────────

/// Request dispatcher served by an [`RpcServer`].
pub trait Endpoint: Send + Sync + 'static {
    type Request: DeserializeOwned + Serialize;
    type Response: DeserializeOwned + Serialize;

    fn method(request: &Self::Request) -> &'static str;

    fn handle(&self, request: Self::Request) -> Result<Self::Response>;
}

pub struct MetadataEndpoint(pub Arc<dyn MetadataService>);

impl Endpoint for MetadataEndpoint {
    type Request = MetadataRequest;
    type Response = MetadataResponse;

    fn method(request: &MetadataRequest) -> &'static str {
        request.method()
    }

    fn handle(&self, request: MetadataRequest) -> Result<MetadataResponse> {
        let svc = &self.0;
        match request {
            MetadataRequest::Mknode { ty, parent, name } => match svc.mknode(ty, parent, &name) {
                Ok(id) => Ok(MetadataResponse::Inode(id)),
                Err(DfsError::AlreadyExist) => Ok(MetadataResponse::Inode(InodeId(0))),
                Err(err) => Err(err),
            },
            MetadataRequest::Unlink { parent, name } => {
                svc.unlink(parent, &name).map(MetadataResponse::Flag)
            }
            MetadataRequest::Lookup { parent, name } => match svc.lookup(parent, &name) {
                Ok(id) => Ok(MetadataResponse::Inode(id)),
                Err(DfsError::NotExist) => Ok(MetadataResponse::Inode(InodeId(0))),
                Err(err) => Err(err),
            },
            MetadataRequest::Readdir { inode } => svc.readdir(inode).map(MetadataResponse::Entries),
            MetadataRequest::GetTypeAttr { inode } => svc
                .get_type_attr(inode)
                .map(|(ty, attr)| MetadataResponse::type_attr(ty, attr)),
            MetadataRequest::GetBlockMap { inode } => {
                svc.get_block_map(inode).map(MetadataResponse::BlockMap)
            }
            MetadataRequest::AllocBlock { inode } => {
                svc.alloc_block(inode).map(MetadataResponse::Block)
            }
            MetadataRequest::FreeBlock {
                inode,
                block_id,
                mac_id,
            } => svc
                .free_block(inode, block_id, mac_id)
                .map(MetadataResponse::Flag),
            MetadataRequest::ExtendSize { inode, end } => {
                svc.extend_size(inode, end).map(MetadataResponse::Size)
            }
        }
    }
}

pub struct DataEndpoint(pub Arc<dyn DataService>);

impl Endpoint for DataEndpoint {
    type Request = DataRequest;
    type Response = DataResponse;

    fn method(request: &DataRequest) -> &'static str {
        request.method()
    }

    fn handle(&self, request: DataRequest) -> Result<DataResponse> {
        let svc = &self.0;
        match request {
            DataRequest::ReadData {
                block_id,
                offset,
                len,
                version,
            } => svc
                .read_data(block_id, offset, len, version)
                .map(DataResponse::Bytes),
            DataRequest::WriteData {
                block_id,
                offset,
                bytes,
            } => svc
                .write_data(block_id, offset, &bytes)
                .map(DataResponse::Flag),
            DataRequest::AllocBlock => svc
                .alloc_block()
                .map(|(block_id, version)| DataResponse::Allocated { block_id, version }),
            DataRequest::FreeBlock { block_id } => {
                svc.free_block(block_id).map(DataResponse::Flag)
            }
        }
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Lock-free request counters shared by all workers.
#[derive(Debug, Default)]
pub struct ServerStats {
    requests_total: AtomicU64,
    requests_err: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub requests_err: u64,
}

impl ServerStats {
    fn record(&self, ok: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.requests_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_err: self.requests_err.load(Ordering::Relaxed),
        }
    }
}

// ── Server ──────────────────────────────────────────────────────────────────

pub(crate) enum Message {
    Call {
        payload: Vec<u8>,
        reply: mpsc::Sender<Vec<u8>>,
    },
    Stop,
}

pub struct RpcServer<E: Endpoint> {
    tx: mpsc::Sender<Message>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ServerStats>,
    _endpoint: std::marker::PhantomData<fn() -> E>,
}

impl<E: Endpoint> RpcServer<E> {
    pub fn start(endpoint: E, options: &RpcServerOptions) -> Result<Self> {
        options.validate()?;
        let threads = options.resolved_thread_count();
        let (tx, rx) = mpsc::channel::<Message>();
        let rx = Arc::new(Mutex::new(rx));
        let endpoint = Arc::new(endpoint);
        let stats = Arc::new(ServerStats::default());

        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let rx = Arc::clone(&rx);
            let endpoint = Arc::clone(&endpoint);
            let stats = Arc::clone(&stats);
            let handle = std::thread::Builder::new()
                .name(format!("dfs-rpc-{idx}"))
                .spawn(move || worker_loop(&*endpoint, &rx, &stats))?;
            workers.push(handle);
        }
        info!(workers = threads, "rpc_server: started");
        Ok(Self {
            tx,
            workers,
            stats,
            _endpoint: std::marker::PhantomData,
        })
    }

    /// A client bound to this server. Clients outlive the server safely;
    /// their calls fail with `Transport` once it has stopped.
    #[must_use]
    pub fn client(&self) -> RpcClient<E::Request, E::Response> {
        RpcClient::new(self.tx.clone())
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl<E: Endpoint> Drop for RpcServer<E> {
    fn drop(&mut self) {
        for _ in &self.workers {
            // A send failure means every worker is already gone.
            let _ = self.tx.send(Message::Stop);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("rpc_server: worker panicked");
            }
        }
        info!("rpc_server: stopped");
    }
}

fn worker_loop<E: Endpoint>(
    endpoint: &E,
    rx: &Mutex<mpsc::Receiver<Message>>,
    stats: &ServerStats,
) {
    loop {
        let message = rx.lock().recv();
        match message {
            Ok(Message::Call { payload, reply }) => {
                let (bytes, ok) = serve_one(endpoint, &payload);
                stats.record(ok);
                // The caller may have given up waiting; nothing to do then.
                let _ = reply.send(bytes);
            }
            Ok(Message::Stop) | Err(_) => return,
        }
    }
}

fn serve_one<E: Endpoint>(endpoint: &E, payload: &[u8]) -> (Vec<u8>, bool) {
    let reply: Reply<E::Response> = match serde_json::from_slice::<E::Request>(payload) {
        Ok(request) => {
            let method = E::method(&request);
            trace!(method, "rpc_server: dispatch");
            endpoint.handle(request).map_err(|err| {
                debug!(method, error = %err, "rpc_server: call failed");
                RemoteError::from_error(&err)
            })
        }
        Err(err) => Err(RemoteError::from_error(&DfsError::Format(format!(
            "malformed request: {err}"
        )))),
    };
    let ok = reply.is_ok();
    match serde_json::to_vec(&reply) {
        Ok(bytes) => (bytes, ok),
        Err(err) => {
            let fallback: Reply<E::Response> = Err(RemoteError::from_error(&DfsError::Transport(
                format!("reply encoding failed: {err}"),
            )));
            (serde_json::to_vec(&fallback).unwrap_or_default(), false)
        }
    }
}
