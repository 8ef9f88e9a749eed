use dfs::{
    ClusterOptions, DataNodeOptions, DfsError, InodeId, InodeType, LocalCluster, MacId,
    MetadataOptions, MetadataService, RpcServerOptions, Version,
};
use std::sync::Arc;
use std::thread;

fn options(served: bool) -> ClusterOptions {
    ClusterOptions {
        metadata: MetadataOptions {
            block_size: 4096,
            user_blocks: 512,
            log_blocks: 128,
            max_inodes: 128,
            ..MetadataOptions::default()
        },
        data: DataNodeOptions {
            block_size: 4096,
            block_count: 256,
            lock_stripes: 16,
        },
        data_nodes: 2,
        served,
        rpc: RpcServerOptions { worker_threads: 4 },
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

#[test]
fn write_then_read_spanning_blocks() {
    for served in [false, true] {
        let cluster = LocalCluster::start(&options(served)).expect("cluster");
        let client = cluster.client();
        let f = client
            .mknode(InodeType::File, InodeId::ROOT, "report")
            .expect("mknode");

        let data = pattern(5000, 0x5a);
        client.write_file(f, 0, &data).expect("write");

        assert_eq!(client.read_file(f, 0, 5000).expect("read"), data);
        assert_eq!(
            client.read_file(f, 4000, 2000).expect("read tail"),
            data[4000..].to_vec()
        );
        let (ty, attr) = client.get_type_attr(f).expect("attr");
        assert_eq!(ty, InodeType::File);
        assert_eq!(attr.size, 5000);
    }
}

#[test]
fn unlink_releases_data_blocks() {
    let cluster = LocalCluster::start(&options(false)).expect("cluster");
    let client = cluster.client();
    let f = client
        .mknode(InodeType::File, InodeId::ROOT, "scratch")
        .expect("mknode");
    client
        .write_file(f, 0, &pattern(3 * 4096, 1))
        .expect("write");

    let map = cluster.metadata().get_block_map(f).expect("block map");
    assert_eq!(map.len(), 3);
    let before: Vec<Version> = map
        .iter()
        .map(|info| {
            let node = cluster.data_node(info.mac_id).expect("node");
            assert!(node.is_allocated(info.block_id).expect("bit"));
            node.version_of(info.block_id).expect("version")
        })
        .collect();

    client.unlink(InodeId::ROOT, "scratch").expect("unlink");

    for (info, old) in map.iter().zip(before) {
        let node = cluster.data_node(info.mac_id).expect("node");
        assert!(!node.is_allocated(info.block_id).expect("bit"));
        assert!(node.version_of(info.block_id).expect("version").0 > old.0);
    }
    let names: Vec<String> = client
        .readdir(InodeId::ROOT)
        .expect("readdir")
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(!names.contains(&"scratch".to_owned()));
    assert!(matches!(
        client.lookup(InodeId::ROOT, "scratch"),
        Err(DfsError::NotExist)
    ));
}

#[test]
fn namespace_errors_cross_the_wire() {
    let cluster = LocalCluster::start(&options(true)).expect("cluster");
    let client = cluster.client();
    let dir = client
        .mknode(InodeType::Directory, InodeId::ROOT, "d")
        .expect("mkdir");
    client
        .mknode(InodeType::File, dir, "inner")
        .expect("mknode");

    assert!(matches!(
        client.mknode(InodeType::File, InodeId::ROOT, "d"),
        Err(DfsError::AlreadyExist)
    ));
    assert!(matches!(
        client.lookup(dir, "missing"),
        Err(DfsError::NotExist)
    ));
    assert!(client.unlink(InodeId::ROOT, "d").is_err());
    assert_eq!(client.lookup(InodeId::ROOT, "d").expect("still there"), dir);
}

#[test]
fn concurrent_mknode_yields_distinct_inodes() {
    let cluster = Arc::new(LocalCluster::start(&options(true)).expect("cluster"));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cluster = Arc::clone(&cluster);
            thread::spawn(move || {
                (0..8)
                    .map(|i| {
                        cluster
                            .client()
                            .mknode(InodeType::File, InodeId::ROOT, &format!("f{t}-{i}"))
                            .expect("mknode")
                    })
                    .collect::<Vec<InodeId>>()
            })
        })
        .collect();

    let mut inodes: Vec<InodeId> = handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("join"))
        .collect();
    inodes.sort_by_key(|inode| inode.0);
    inodes.dedup();
    assert_eq!(inodes.len(), 32);
    assert_eq!(
        cluster.client().readdir(InodeId::ROOT).expect("readdir").len(),
        32
    );
}

#[test]
fn cluster_options_from_json() {
    let parsed = ClusterOptions::from_json(r#"{"data_nodes": 3, "served": true}"#)
        .expect("parse");
    assert_eq!(parsed.data_nodes, 3);
    assert!(parsed.served);
    assert_eq!(parsed.metadata, MetadataOptions::default());

    let mismatched = r#"{"data": {"block_size": 1024}}"#;
    assert!(matches!(
        ClusterOptions::from_json(mismatched),
        Err(DfsError::InvalidArg(_))
    ));

    let cluster = LocalCluster::start(&options(false)).expect("cluster");
    assert!(cluster.data_node(MacId(0)).is_none());
    assert!(cluster.data_node(MacId(2)).is_some());
    assert!(cluster.data_node(MacId(3)).is_none());
}
