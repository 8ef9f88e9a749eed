use dfs_block::{ByteBlockDevice, MemByteDevice};
use dfs_client::Client;
use dfs_datanode::{DataNode, DataNodeOptions};
use dfs_error::{DfsError, Result};
use dfs_metadata::{MetadataNode, MetadataOptions};
use dfs_rpc::{
    DataClient, DataEndpoint, DataService, MetadataClient, MetadataEndpoint, MetadataService,
    RpcServer, RpcServerOptions,
};
use dfs_types::MacId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

type MemDevice = ByteBlockDevice<MemByteDevice>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    pub metadata: MetadataOptions,
    pub data: DataNodeOptions,
    pub data_nodes: usize,
    /// Put every node behind an [`RpcServer`] instead of calling it directly.
    pub served: bool,
    pub rpc: RpcServerOptions,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            metadata: MetadataOptions::default(),
            data: DataNodeOptions::default(),
            data_nodes: 2,
            served: false,
            rpc: RpcServerOptions::default(),
        }
    }
}

impl ClusterOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)
            .map_err(|err| DfsError::Format(format!("cluster options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        self.data.validate()?;
        self.rpc.validate()?;
        if self.data.block_size != self.metadata.block_size {
            return Err(DfsError::InvalidArg(format!(
                "data block size {} differs from metadata block size {}",
                self.data.block_size, self.metadata.block_size
            )));
        }
        Ok(())
    }
}

/// Metadata node, data nodes and a client in one process, on memory devices.
pub struct LocalCluster {
    metadata: Arc<MetadataNode<MemDevice>>,
    data_nodes: Vec<Arc<DataNode<MemDevice>>>,
    client: Client,
    _metadata_server: Option<RpcServer<MetadataEndpoint>>,
    _data_servers: Vec<RpcServer<DataEndpoint>>,
}

impl LocalCluster {
    pub fn start(options: &ClusterOptions) -> Result<Self> {
        options.validate()?;
        let metadata = Arc::new(MetadataNode::in_memory(options.metadata.clone())?);
        let mut client = Client::new(options.data.block_size);
        let mut data_nodes = Vec::with_capacity(options.data_nodes);
        let mut data_servers = Vec::new();

        for _ in 0..options.data_nodes {
            let node = Arc::new(DataNode::in_memory(&options.data)?);
            let service: Arc<dyn DataService> = if options.served {
                let server = RpcServer::start(DataEndpoint(node.clone()), &options.rpc)?;
                let stub = Arc::new(DataClient::new(server.client()));
                data_servers.push(server);
                stub
            } else {
                node.clone()
            };
            let mac = metadata.reg_server(Arc::clone(&service))?;
            let client_mac = client.register_data_server(service)?;
            if mac != client_mac {
                return Err(DfsError::InvalidArg(format!(
                    "machine id mismatch: metadata {mac}, client {client_mac}"
                )));
            }
            data_nodes.push(node);
        }

        let mut metadata_server = None;
        let meta_service: Arc<dyn MetadataService> = if options.served {
            let server = RpcServer::start(MetadataEndpoint(metadata.clone()), &options.rpc)?;
            let stub = Arc::new(MetadataClient::new(server.client()));
            metadata_server = Some(server);
            stub
        } else {
            metadata.clone()
        };
        client.register_metadata_server(meta_service);

        info!(
            data_nodes = options.data_nodes,
            served = options.served,
            "cluster: started"
        );
        Ok(Self {
            metadata,
            data_nodes,
            client,
            _metadata_server: metadata_server,
            _data_servers: data_servers,
        })
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataNode<MemDevice> {
        &self.metadata
    }

    /// Data node registered under `mac_id`.
    #[must_use]
    pub fn data_node(&self, mac_id: MacId) -> Option<&DataNode<MemDevice>> {
        usize::from(mac_id.0)
            .checked_sub(1)
            .and_then(|idx| self.data_nodes.get(idx))
            .map(AsRef::as_ref)
    }
}
