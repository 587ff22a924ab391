//! Crash recovery: the graph rebuilds its node table from the backing store

mod common;

use common::{TestStore, GRAPH_DATASET};
use zdataset::{DatasetService, ZfsCreate, ZfsSnapshot};
use zoci::image::ImageError;

#[test]
fn test_reload_detects_and_removes_orphan_node() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();
    drop(distribution);

    let datasets_before = store.handle.dataset_names();
    let snapshots_before = store.handle.snapshot_names();

    // simulate a crash between commit and blob save during a second image
    // creation: a committed node exists on the backing store, referenced by
    // nothing
    let orphan_id = "ab".repeat(32);
    let base_id = &orphan_id[..12];
    let base_dataset = format!("{GRAPH_DATASET}/{base_id}");
    let node_dataset = format!("{base_dataset}/{orphan_id}");
    let mount = store.config().graph_mount_dir.join(&orphan_id);
    let mut create_base = ZfsCreate::new(&base_dataset, false, true);
    create_base.insert_prop("mountpoint", "none");
    store.handle.create(create_base).unwrap();
    let mut create_node = ZfsCreate::new(&node_dataset, false, false);
    create_node.mountpoint(&mount);
    store.handle.create(create_node).unwrap();
    std::fs::write(mount.join("leftover"), b"partial\n").unwrap();
    store.handle.set_readonly(&node_dataset, true).unwrap();
    let mut snapshot = ZfsSnapshot::new(&base_dataset, &orphan_id);
    snapshot.set_recursive(true);
    store.handle.snapshot(snapshot).unwrap();

    // on the next startup the orphan shows up in the node table
    let mut distribution = store.open_distribution();
    let orphan = distribution
        .layers()
        .graph()
        .node(&orphan_id)
        .expect("orphan node must be visible after reload");
    assert!(orphan.committed());
    assert!(orphan.diff().is_none());
    assert!(orphan.parent().is_none());

    // the image imported before the crash still resolves
    assert!(distribution.get_image("hello:latest").is_ok());

    // removing the orphan restores the backing store exactly
    distribution.remove_scratch_node(&orphan_id).unwrap();
    assert_eq!(store.handle.dataset_names(), datasets_before);
    assert_eq!(store.handle.snapshot_names(), snapshots_before);
    assert!(!mount.exists());
    assert!(distribution.layers().graph().node(&orphan_id).is_none());
}

#[test]
fn test_reload_ignores_foreign_datasets() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    let image = distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();
    let node_id = image.layers[0].node_id().to_string();
    drop(distribution);

    // datasets that do not follow the id discipline are not nodes
    store
        .handle
        .create(ZfsCreate::new(&format!("{GRAPH_DATASET}/backup"), false, true))
        .unwrap();
    store
        .handle
        .create(ZfsCreate::new(
            &format!("{GRAPH_DATASET}/backup/not-a-node"),
            false,
            true,
        ))
        .unwrap();

    let distribution = store.open_distribution();
    let node_ids: Vec<String> = distribution
        .layers()
        .graph()
        .nodes()
        .map(|node| node.id().to_string())
        .collect();
    assert_eq!(node_ids, vec![node_id]);
}

#[test]
fn test_parent_node_cannot_be_removed() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    let image = distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap()
        .clone();
    let top_node = image.layers[0].node_id().to_string();

    let scratch = distribution.new_scratch_layer(&image).unwrap();

    // the top layer now has a child and refuses removal, leaving both nodes
    // intact
    assert!(matches!(
        distribution.remove_scratch_node(&top_node),
        Err(ImageError::LayerInUse(_))
    ));
    assert!(distribution.layers().graph().node(&top_node).is_some());
    assert!(distribution
        .layers()
        .graph()
        .node(scratch.node_id())
        .is_some());

    // removing the leaf first unblocks the parent
    distribution.remove_scratch_node(scratch.node_id()).unwrap();
    distribution.remove_image("hello:latest").unwrap();
}
