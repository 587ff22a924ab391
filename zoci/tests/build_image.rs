//! Dockerfile builds: layer chaining, config mutation, derived images

mod common;

use common::TestStore;
use oci_model::models::ImageIndex;
use zoci::build::build_image;
use zoci::image::ImageError;

#[test]
fn test_build_from_scratch_with_tar_and_file() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("base");

    let context = store.root.path().join("context");
    std::fs::create_dir_all(&context).unwrap();
    std::fs::copy(&rootfs, context.join("rootfs.tar")).unwrap();
    std::fs::write(context.join("motd"), b"welcome\n").unwrap();
    std::fs::write(
        context.join("Dockerfile"),
        concat!(
            "# tiny image\n",
            "FROM scratch\n",
            "ADD rootfs.tar /\n",
            "ADD motd /etc/motd\n",
            "ENV LANG=C\n",
            "WORKDIR /srv\n",
            "CMD /bin/sh -c true\n",
        ),
    )
    .unwrap();

    let references = build_image(
        &mut distribution,
        &context,
        None,
        &["built:latest", "built:v1"],
    )
    .unwrap();
    assert_eq!(references.len(), 2);

    let image = distribution.get_image("built:latest").unwrap().clone();
    assert_eq!(image.layers.len(), 2);
    assert_eq!(image.config.rootfs.diff_ids.len(), 2);

    // second layer is chained onto the first
    let graph = distribution.layers().graph();
    let top = graph.node(image.layers[1].node_id()).unwrap();
    assert_eq!(top.parent(), Some(image.layers[0].node_id()));

    // the top tree holds both the base content and the added file
    let mount = store
        .config()
        .graph_mount_dir
        .join(image.layers[1].node_id());
    assert_eq!(std::fs::read(mount.join("etc/hello")).unwrap(), b"hi\n");
    assert_eq!(std::fs::read(mount.join("etc/motd")).unwrap(), b"welcome\n");

    // config picked up ENV/WORKDIR/CMD
    let inner = image.config.config.clone().unwrap();
    assert_eq!(inner.env, Some(vec!["LANG=C".to_string()]));
    assert_eq!(inner.working_dir, Some("/srv".to_string()));
    assert_eq!(
        inner.cmd,
        Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "true".to_string()
        ])
    );

    // layered history matches the layer count
    assert_eq!(
        image.config.layered_history().count(),
        image.layers.len()
    );

    // both tags point at the same manifest
    let v1 = distribution.get_image("built:v1").unwrap();
    assert_eq!(v1.manifest_id, image.manifest_id);
}

#[test]
fn test_image_with_derived_image_cannot_be_removed() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let context = store.root.path().join("context");
    std::fs::create_dir_all(&context).unwrap();
    std::fs::write(context.join("extra"), b"more\n").unwrap();
    std::fs::write(
        context.join("Dockerfile"),
        "FROM hello:latest\nADD extra /opt/extra\n",
    )
    .unwrap();
    build_image(&mut distribution, &context, None, &["derived:latest"]).unwrap();

    let index_before =
        std::fs::read(store.root.path().join("repositories/hello.json")).unwrap();

    // the base image's top layer is the parent of the derived image's layer
    assert!(matches!(
        distribution.remove_image("hello:latest"),
        Err(ImageError::ImageInUse(_))
    ));
    let index_after =
        std::fs::read(store.root.path().join("repositories/hello.json")).unwrap();
    assert_eq!(index_before, index_after);

    // shared chain: removing the derived image keeps the base layer alive
    distribution.remove_image("derived:latest").unwrap();
    distribution.remove_image("hello:latest").unwrap();
    assert_eq!(distribution.layers().graph().nodes().count(), 0);
}

#[test]
fn test_derived_image_reuses_base_chain() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    let base = distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap()
        .clone();

    let context = store.root.path().join("context");
    std::fs::create_dir_all(&context).unwrap();
    std::fs::write(context.join("extra"), b"more\n").unwrap();
    std::fs::write(
        context.join("Dockerfile"),
        "FROM hello:latest\nADD extra /opt/extra\n",
    )
    .unwrap();
    build_image(&mut distribution, &context, None, &["derived:latest"]).unwrap();

    let derived = distribution.get_image("derived:latest").unwrap();
    assert_eq!(derived.layers.len(), 2);
    // first layer is literally the base image's layer
    assert_eq!(
        derived.layers[0].node_id(),
        base.layers[0].node_id()
    );
    assert_eq!(
        derived.config.rootfs.diff_ids[0],
        base.config.rootfs.diff_ids[0]
    );
    // the new layer's diff carries only the added path
    let repository_index =
        std::fs::read(store.root.path().join("repositories/derived.json")).unwrap();
    let index: ImageIndex = serde_json::from_slice(&repository_index).unwrap();
    assert_eq!(index.manifests.len(), 1);

    // base inherited config survives unless overridden
    let inner = derived.config.config.clone().unwrap();
    assert_eq!(inner.cmd, Some(vec!["/bin/sh".to_string()]));
}

#[test]
fn test_save_node_formats() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    let base = distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap()
        .clone();

    let context = store.root.path().join("context");
    std::fs::create_dir_all(&context).unwrap();
    std::fs::write(context.join("extra"), b"more\n").unwrap();
    std::fs::write(
        context.join("Dockerfile"),
        "FROM hello:latest\nADD extra /opt/extra\n",
    )
    .unwrap();
    build_image(&mut distribution, &context, None, &["derived:latest"]).unwrap();
    let derived_node = distribution
        .get_image("derived:latest")
        .unwrap()
        .layers[1]
        .node_id()
        .to_string();
    let root_node = base.layers[0].node_id().to_string();

    let graph = distribution.layers().graph();

    // chain roots serialize to tar archives
    let tar_out = store.root.path().join("root-node.tar");
    graph.save(&root_node, &tar_out).unwrap();
    let unpacked = store.root.path().join("root-node-unpacked");
    zoci::util::archive::unpack_file(&tar_out, &unpacked).unwrap();
    assert_eq!(std::fs::read(unpacked.join("etc/hello")).unwrap(), b"hi\n");

    // any committed node serializes to a native stream
    let zfs_out = store.root.path().join("derived-node.zfs");
    graph.save(&derived_node, &zfs_out).unwrap();
    assert!(std::fs::metadata(&zfs_out).unwrap().len() > 0);

    // a derived node has no standalone tar rendition
    assert!(matches!(
        graph.save(&derived_node, store.root.path().join("derived-node.tar")),
        Err(zoci::graph::GraphError::UnsupportedSave(_, _))
    ));
    // unknown suffixes are rejected outright
    assert!(matches!(
        graph.save(&root_node, store.root.path().join("root-node.bin")),
        Err(zoci::graph::GraphError::UnsupportedSave(_, _))
    ));
}

#[test]
fn test_build_rejects_bad_dockerfiles() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();

    let context = store.root.path().join("context");
    std::fs::create_dir_all(&context).unwrap();

    std::fs::write(context.join("Dockerfile"), "ADD a /a\n").unwrap();
    assert!(matches!(
        build_image(&mut distribution, &context, None, &["x:latest"]),
        Err(ImageError::DockerfileParse(_))
    ));

    std::fs::write(context.join("Dockerfile"), "FROM scratch\nBOGUS arg\n").unwrap();
    assert!(matches!(
        build_image(&mut distribution, &context, None, &["x:latest"]),
        Err(ImageError::DockerfileParse(_))
    ));

    std::fs::write(
        context.join("Dockerfile"),
        "FROM scratch\nRUN echo hi\n",
    )
    .unwrap();
    assert!(matches!(
        build_image(&mut distribution, &context, None, &["x:latest"]),
        Err(ImageError::Unsupported(_))
    ));

    std::fs::write(context.join("Dockerfile"), "FROM scratch\n").unwrap();
    assert!(matches!(
        build_image(&mut distribution, &context, None, &["x:latest"]),
        Err(ImageError::DockerfileParse(_))
    ));
}
