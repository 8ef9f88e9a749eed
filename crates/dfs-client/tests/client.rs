//! Client against real nodes, both in-process and behind RPC servers.

use dfs_block::{ByteBlockDevice, MemByteDevice};
use dfs_client::Client;
use dfs_datanode::{DataNode, DataNodeOptions};
use dfs_error::DfsError;
use dfs_inode::Inode;
use dfs_metadata::{MetadataNode, MetadataOptions};
use dfs_rpc::{
    DataClient, DataEndpoint, DataService, MetadataClient, MetadataEndpoint, MetadataService,
    RpcServer, RpcServerOptions,
};
use dfs_types::{InodeId, InodeType};
use std::sync::Arc;

const BLOCK_SIZE: u32 = 512;

type Data = DataNode<ByteBlockDevice<MemByteDevice>>;
type Meta = MetadataNode<ByteBlockDevice<MemByteDevice>>;

fn meta_options() -> MetadataOptions {
    MetadataOptions {
        block_size: BLOCK_SIZE,
        user_blocks: 256,
        log_blocks: 128,
        max_inodes: 64,
        lock_stripes: 8,
        ..MetadataOptions::default()
    }
}

fn data_node() -> Arc<Data> {
    Arc::new(
        DataNode::in_memory(&DataNodeOptions {
            block_size: BLOCK_SIZE,
            block_count: 128,
            lock_stripes: 8,
        })
        .expect("data node"),
    )
}

fn local() -> (Client, Arc<Meta>, Vec<Arc<Data>>) {
    let meta = Arc::new(MetadataNode::in_memory(meta_options()).expect("metadata"));
    let mut client = Client::new(BLOCK_SIZE);
    client.register_metadata_server(meta.clone());
    let nodes = vec![data_node(), data_node()];
    for node in &nodes {
        let mac = meta.reg_server(node.clone()).expect("register");
        assert_eq!(client.register_data_server(node.clone()).expect("register"), mac);
    }
    (client, meta, nodes)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn multi_block_write_reads_back() {
    let (client, _meta, _nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "a")
        .expect("mknode");
    let data = pattern(1700);
    client.write_file(f, 0, &data).expect("write");

    assert_eq!(client.read_file(f, 0, 1700).expect("read"), data);
    assert_eq!(client.read_file(f, 600, 100).expect("read"), data[600..700]);
    assert_eq!(client.get_type_attr(f).expect("attr").1.size, 1700);
}

#[test]
fn reads_are_clamped_to_size() {
    let (client, _meta, _nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "f")
        .expect("mknode");
    client.write_file(f, 0, b"0123456789").expect("write");
    assert_eq!(client.read_file(f, 5, 100).expect("read"), b"56789");
    assert!(client.read_file(f, 10, 4).expect("read").is_empty());
}

#[test]
fn overwrite_in_the_middle_keeps_size() {
    let (client, _meta, _nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "f")
        .expect("mknode");
    let mut data = pattern(1200);
    client.write_file(f, 0, &data).expect("write");
    client.write_file(f, 510, b"XXXX").expect("overwrite");
    data[510..514].copy_from_slice(b"XXXX");
    assert_eq!(client.read_file(f, 0, 1200).expect("read"), data);
    assert_eq!(client.get_type_attr(f).expect("attr").1.size, 1200);
}

#[test]
fn stale_block_fails_after_one_refresh() {
    let (client, meta, nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "f")
        .expect("mknode");
    client.write_file(f, 0, b"payload").expect("write");

    // Free the block behind the metadata node's back: its map keeps the old
    // version, so even a refreshed map is stale.
    let map = meta.get_block_map(f).expect("map");
    assert_eq!(map.len(), 1);
    nodes[0].free_block(map[0].block_id).expect("free");
    assert!(matches!(
        client.read_file(f, 0, 7),
        Err(DfsError::InvalidArg(_))
    ));
}

#[test]
fn unlink_releases_data_blocks() {
    let (client, _meta, nodes) = local();
    let before = nodes[0].free_block_count().expect("count");
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "f")
        .expect("mknode");
    client.write_file(f, 0, &pattern(1536)).expect("write");
    assert_eq!(nodes[0].free_block_count().expect("count"), before - 3);

    client.unlink(InodeId::ROOT, "f").expect("unlink");
    assert_eq!(nodes[0].free_block_count().expect("count"), before);
    assert!(client.readdir(InodeId::ROOT).expect("readdir").is_empty());
    assert!(matches!(
        client.lookup(InodeId::ROOT, "f"),
        Err(DfsError::NotExist)
    ));
}

#[test]
fn write_past_u64_max_is_rejected() {
    let (client, meta, _nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "edge")
        .expect("mknode");

    assert!(matches!(
        client.write_file(f, u64::MAX - 2, b"abcd"),
        Err(DfsError::InvalidArg(_))
    ));
    assert!(meta.get_block_map(f).expect("map").is_empty());
    assert_eq!(client.get_type_attr(f).expect("attr").1.size, 0);
    assert!(client.read_file(f, u64::MAX - 2, 4).expect("read").is_empty());
}

#[test]
fn write_beyond_largest_block_map_allocates_nothing() {
    let (client, meta, nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "far")
        .expect("mknode");
    let before: Vec<u64> = nodes
        .iter()
        .map(|node| node.free_block_count().expect("count"))
        .collect();

    let limit = Inode::max_map_entries(BLOCK_SIZE as usize) as u64;
    let offset = limit * u64::from(BLOCK_SIZE);
    assert!(matches!(
        client.write_file(f, offset, b"x"),
        Err(DfsError::InvalidArg(_))
    ));
    assert!(meta.get_block_map(f).expect("map").is_empty());
    for (node, count) in nodes.iter().zip(before) {
        assert_eq!(node.free_block_count().expect("count"), count);
    }
}

#[test]
fn failed_sparse_write_releases_the_blocks_it_claimed() {
    let (client, meta, nodes) = local();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "sparse")
        .expect("mknode");
    client.write_file(f, 0, b"head").expect("write");
    let kept = meta.get_block_map(f).expect("map");
    let data_before: Vec<u64> = nodes
        .iter()
        .map(|node| node.free_block_count().expect("count"))
        .collect();
    let meta_before = meta.free_block_count().expect("count");

    // Inside the map limit, but far more blocks than both data nodes hold.
    let limit = Inode::max_map_entries(BLOCK_SIZE as usize) as u64;
    let offset = (limit - 1) * u64::from(BLOCK_SIZE);
    assert!(matches!(
        client.write_file(f, offset, b"tail"),
        Err(DfsError::OutOfResource)
    ));

    assert_eq!(meta.get_block_map(f).expect("map"), kept);
    for (node, count) in nodes.iter().zip(data_before) {
        assert_eq!(node.free_block_count().expect("count"), count);
    }
    assert_eq!(meta.free_block_count().expect("count"), meta_before);
    assert_eq!(client.get_type_attr(f).expect("attr").1.size, 4);
    assert_eq!(client.read_file(f, 0, 4).expect("read"), b"head");
}

#[test]
fn served_nodes_behave_like_local_ones() {
    let opts = RpcServerOptions { worker_threads: 2 };
    let meta = Arc::new(MetadataNode::in_memory(meta_options()).expect("metadata"));
    let data = data_node();
    let data_server = RpcServer::start(DataEndpoint(data.clone()), &opts).expect("data server");
    let meta_server =
        RpcServer::start(MetadataEndpoint(meta.clone()), &opts).expect("metadata server");

    // The metadata node reaches the data node over RPC as well.
    meta.reg_server(Arc::new(DataClient::new(data_server.client())))
        .expect("register");
    let mut client = Client::new(BLOCK_SIZE);
    client.register_metadata_server(Arc::new(MetadataClient::new(meta_server.client())));
    client
        .register_data_server(Arc::new(DataClient::new(data_server.client())))
        .expect("register");

    let dir = client
        .mknode(InodeType::Directory, InodeId::ROOT, "dir")
        .expect("mkdir");
    assert!(matches!(
        client.mknode(InodeType::Directory, InodeId::ROOT, "dir"),
        Err(DfsError::AlreadyExist)
    ));
    let f = client.mknode(InodeType::File, dir, "f").expect("mknode");
    let payload = pattern(900);
    client.write_file(f, 0, &payload).expect("write");
    assert_eq!(client.read_file(f, 0, 900).expect("read"), payload);

    let map = meta.get_block_map(f).expect("map");
    assert_eq!(map.len(), 2);
    assert!(
        client
            .free_file_block(f, map[1].block_id, map[1].mac_id)
            .expect("free")
    );
    assert!(!data.is_allocated(map[1].block_id).expect("bit"));
    assert!(meta_server.stats().requests_total > 0);
}
