//! Client stubs.

use crate::protocol::{DataRequest, DataResponse, MetadataRequest, MetadataResponse, Reply};
use crate::server::Message;
use crate::service::{DataService, MetadataService};
use dfs_dir::DirEntry;
use dfs_error::{DfsError, Result};
use dfs_types::{BlockId, BlockInfo, FileAttr, InodeId, InodeType, MacId, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::mpsc;

/// Typed handle on a running [`crate::RpcServer`].
pub struct RpcClient<Req, Resp> {
    tx: mpsc::Sender<Message>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for RpcClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Req: Serialize, Resp: DeserializeOwned> RpcClient<Req, Resp> {
    pub(crate) fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            _marker: PhantomData,
        }
    }

    /// Send one request and block for its reply.
    pub fn call(&self, request: &Req) -> Result<Resp> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| DfsError::Transport(format!("request encoding failed: {err}")))?;
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Message::Call {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| DfsError::Transport("server is shut down".to_owned()))?;
        let bytes = reply_rx
            .recv()
            .map_err(|_| DfsError::Transport("server dropped the call".to_owned()))?;
        let reply: Reply<Resp> = serde_json::from_slice(&bytes)
            .map_err(|err| DfsError::Transport(format!("reply decoding failed: {err}")))?;
        reply.map_err(crate::RemoteError::into_error)
    }
}

fn unexpected(method: &str) -> DfsError {
    DfsError::Transport(format!("unexpected reply to {method}"))
}

// ── Metadata ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MetadataClient {
    rpc: RpcClient<MetadataRequest, MetadataResponse>,
}

impl MetadataClient {
    #[must_use]
    pub fn new(rpc: RpcClient<MetadataRequest, MetadataResponse>) -> Self {
        Self { rpc }
    }

    fn inode(&self, request: &MetadataRequest) -> Result<InodeId> {
        match self.rpc.call(request)? {
            MetadataResponse::Inode(id) => Ok(id),
            _ => Err(unexpected(request.method())),
        }
    }

    fn flag(&self, request: &MetadataRequest) -> Result<bool> {
        match self.rpc.call(request)? {
            MetadataResponse::Flag(flag) => Ok(flag),
            _ => Err(unexpected(request.method())),
        }
    }
}

impl MetadataService for MetadataClient {
    fn mknode(&self, ty: InodeType, parent: InodeId, name: &str) -> Result<InodeId> {
        let id = self.inode(&MetadataRequest::Mknode {
            ty,
            parent,
            name: name.to_owned(),
        })?;
        if id.0 == 0 {
            return Err(DfsError::AlreadyExist);
        }
        Ok(id)
    }

    fn unlink(&self, parent: InodeId, name: &str) -> Result<bool> {
        self.flag(&MetadataRequest::Unlink {
            parent,
            name: name.to_owned(),
        })
    }

    fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        let id = self.inode(&MetadataRequest::Lookup {
            parent,
            name: name.to_owned(),
        })?;
        if id.0 == 0 {
            return Err(DfsError::NotExist);
        }
        Ok(id)
    }

    fn readdir(&self, inode: InodeId) -> Result<Vec<DirEntry>> {
        let request = MetadataRequest::Readdir { inode };
        match self.rpc.call(&request)? {
            MetadataResponse::Entries(entries) => Ok(entries),
            _ => Err(unexpected(request.method())),
        }
    }

    fn get_type_attr(&self, inode: InodeId) -> Result<(InodeType, FileAttr)> {
        let request = MetadataRequest::GetTypeAttr { inode };
        match self.rpc.call(&request)? {
            MetadataResponse::TypeAttr {
                size,
                atime,
                mtime,
                ctime,
                type_byte,
            } => Ok((
                InodeType::from_byte(type_byte),
                FileAttr {
                    size,
                    atime,
                    mtime,
                    ctime,
                },
            )),
            _ => Err(unexpected(request.method())),
        }
    }

    fn get_block_map(&self, inode: InodeId) -> Result<Vec<BlockInfo>> {
        let request = MetadataRequest::GetBlockMap { inode };
        match self.rpc.call(&request)? {
            MetadataResponse::BlockMap(map) => Ok(map),
            _ => Err(unexpected(request.method())),
        }
    }

    fn alloc_block(&self, inode: InodeId) -> Result<BlockInfo> {
        let request = MetadataRequest::AllocBlock { inode };
        match self.rpc.call(&request)? {
            MetadataResponse::Block(info) => Ok(info),
            _ => Err(unexpected(request.method())),
        }
    }

    fn free_block(&self, inode: InodeId, block_id: BlockId, mac_id: MacId) -> Result<bool> {
        self.flag(&MetadataRequest::FreeBlock {
            inode,
            block_id,
            mac_id,
        })
    }

    fn extend_size(&self, inode: InodeId, end: u64) -> Result<u64> {
        let request = MetadataRequest::ExtendSize { inode, end };
        match self.rpc.call(&request)? {
            MetadataResponse::Size(size) => Ok(size),
            _ => Err(unexpected(request.method())),
        }
    }
}

// ── Data ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DataClient {
    rpc: RpcClient<DataRequest, DataResponse>,
}

impl DataClient {
    #[must_use]
    pub fn new(rpc: RpcClient<DataRequest, DataResponse>) -> Self {
        Self { rpc }
    }

    fn flag(&self, request: &DataRequest) -> Result<bool> {
        match self.rpc.call(request)? {
            DataResponse::Flag(flag) => Ok(flag),
            _ => Err(unexpected(request.method())),
        }
    }
}

impl DataService for DataClient {
    fn read_data(
        &self,
        block_id: BlockId,
        offset: u32,
        len: u32,
        version: Version,
    ) -> Result<Vec<u8>> {
        let request = DataRequest::ReadData {
            block_id,
            offset,
            len,
            version,
        };
        match self.rpc.call(&request)? {
            DataResponse::Bytes(bytes) => Ok(bytes),
            _ => Err(unexpected(request.method())),
        }
    }

    fn write_data(&self, block_id: BlockId, offset: u32, bytes: &[u8]) -> Result<bool> {
        self.flag(&DataRequest::WriteData {
            block_id,
            offset,
            bytes: bytes.to_vec(),
        })
    }

    fn alloc_block(&self) -> Result<(BlockId, Version)> {
        let request = DataRequest::AllocBlock;
        match self.rpc.call(&request)? {
            DataResponse::Allocated { block_id, version } => Ok((block_id, version)),
            _ => Err(unexpected(request.method())),
        }
    }

    fn free_block(&self, block_id: BlockId) -> Result<bool> {
        self.flag(&DataRequest::FreeBlock { block_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetadataEndpoint, RpcServer, RpcServerOptions};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Flat namespace: every name lives under the root.
    #[derive(Default)]
    struct FlatNames {
        names: Mutex<BTreeMap<String, InodeId>>,
    }

    impl MetadataService for FlatNames {
        fn mknode(&self, _ty: InodeType, _parent: InodeId, name: &str) -> Result<InodeId> {
            let mut names = self.names.lock();
            if names.contains_key(name) {
                return Err(DfsError::AlreadyExist);
            }
            let id = InodeId(names.len() as u64 + 2);
            names.insert(name.to_owned(), id);
            Ok(id)
        }

        fn unlink(&self, _parent: InodeId, name: &str) -> Result<bool> {
            self.names
                .lock()
                .remove(name)
                .map(|_| true)
                .ok_or(DfsError::NotExist)
        }

        fn lookup(&self, _parent: InodeId, name: &str) -> Result<InodeId> {
            self.names.lock().get(name).copied().ok_or(DfsError::NotExist)
        }

        fn readdir(&self, _inode: InodeId) -> Result<Vec<DirEntry>> {
            Ok(self
                .names
                .lock()
                .iter()
                .map(|(name, inode)| DirEntry {
                    name: name.clone(),
                    inode: *inode,
                })
                .collect())
        }

        fn get_type_attr(&self, inode: InodeId) -> Result<(InodeType, FileAttr)> {
            let ty = if inode == InodeId::ROOT {
                InodeType::Directory
            } else {
                InodeType::File
            };
            Ok((ty, FileAttr::default()))
        }

        fn get_block_map(&self, _inode: InodeId) -> Result<Vec<BlockInfo>> {
            Ok(Vec::new())
        }

        fn alloc_block(&self, _inode: InodeId) -> Result<BlockInfo> {
            Err(DfsError::OutOfResource)
        }

        fn free_block(&self, _inode: InodeId, _block_id: BlockId, _mac_id: MacId) -> Result<bool> {
            Ok(true)
        }

        fn extend_size(&self, _inode: InodeId, end: u64) -> Result<u64> {
            Ok(end)
        }
    }

    fn serve() -> (RpcServer<MetadataEndpoint>, MetadataClient) {
        let server = RpcServer::start(
            MetadataEndpoint(Arc::new(FlatNames::default())),
            &RpcServerOptions { worker_threads: 1 },
        )
        .expect("start");
        let client = MetadataClient::new(server.client());
        (server, client)
    }

    #[test]
    fn sentinels_become_typed_errors() {
        let (_server, client) = serve();
        let id = client
            .mknode(InodeType::File, InodeId::ROOT, "a")
            .expect("mknode");
        assert_eq!(id, InodeId(2));
        assert!(matches!(
            client.mknode(InodeType::File, InodeId::ROOT, "a"),
            Err(DfsError::AlreadyExist)
        ));
        assert_eq!(client.lookup(InodeId::ROOT, "a").expect("lookup"), id);
        assert!(matches!(
            client.lookup(InodeId::ROOT, "b"),
            Err(DfsError::NotExist)
        ));
    }

    #[test]
    fn sentinel_reaches_the_wire_as_zero() {
        let (server, _client) = serve();
        let rpc = server.client();
        let reply = rpc
            .call(&MetadataRequest::Lookup {
                parent: InodeId::ROOT,
                name: "missing".to_owned(),
            })
            .expect("call");
        assert_eq!(reply, MetadataResponse::Inode(InodeId(0)));
    }

    #[test]
    fn every_method_round_trips() {
        let (_server, client) = serve();
        client
            .mknode(InodeType::File, InodeId::ROOT, "f")
            .expect("mknode");
        let names: Vec<String> = client
            .readdir(InodeId::ROOT)
            .expect("readdir")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["f"]);
        let (ty, _) = client.get_type_attr(InodeId::ROOT).expect("attr");
        assert_eq!(ty, InodeType::Directory);
        assert!(client.get_block_map(InodeId(2)).expect("map").is_empty());
        assert!(matches!(
            client.alloc_block(InodeId(2)),
            Err(DfsError::OutOfResource)
        ));
        assert!(
            client
                .free_block(InodeId(2), BlockId(9), MacId(1))
                .expect("free")
        );
        assert_eq!(client.extend_size(InodeId(2), 77).expect("extend"), 77);
        assert!(client.unlink(InodeId::ROOT, "f").expect("unlink"));
        assert!(matches!(
            client.unlink(InodeId::ROOT, "f"),
            Err(DfsError::NotExist)
        ));
    }
}
