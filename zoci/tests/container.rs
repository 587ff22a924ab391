//! Container lifecycle scenarios over the mock runtime

mod common;

use common::{MockContainerRuntime, TestStore};
use oci_model::runtime::RuntimeSpec;
use zoci::runtime::{CreateContainer, RuntimeError};

#[test]
fn test_create_start_remove_container() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let runner = MockContainerRuntime::new();
    let mut runtime = store.open_runtime(&runner);
    let container = runtime
        .create_container(
            &mut distribution,
            CreateContainer {
                image: "hello",
                name: Some("web"),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo ok".to_string(),
                ]),
                workdir: None,
            },
        )
        .unwrap();
    let id = container.id().to_string();
    let runtime_id = container.runtime_id().to_string();
    let scratch_node = container.scratch_node_id().to_string();
    assert_eq!(runtime_id.len(), 12);
    assert_eq!(&id[..12], runtime_id);

    // the scratch layer is a clone of the image's top layer, writable, with
    // the image contents visible
    let image_top_node = distribution
        .get_image("hello:latest")
        .unwrap()
        .top_layer()
        .unwrap()
        .node_id()
        .to_string();
    let scratch = distribution.layers().graph().node(&scratch_node).unwrap();
    assert_eq!(scratch.parent(), Some(image_top_node.as_str()));
    assert!(!scratch.committed());
    let scratch_mount = store.config().graph_mount_dir.join(&scratch_node);
    assert_eq!(
        std::fs::read(scratch_mount.join("etc/hello")).unwrap(),
        b"hi\n"
    );

    // persisted runtime spec points at the scratch mount and carries the
    // command override
    let config_bytes = std::fs::read(
        store
            .root
            .path()
            .join("containers")
            .join(&id)
            .join("config.json"),
    )
    .unwrap();
    let spec: RuntimeSpec = serde_json::from_slice(&config_bytes).unwrap();
    assert_eq!(spec.root.as_ref().unwrap().path, scratch_mount);
    assert!(!spec.root.as_ref().unwrap().readonly);
    assert_eq!(spec.hostname.as_deref(), Some(runtime_id.as_str()));
    let process = spec.process.as_ref().unwrap();
    assert!(process.terminal);
    assert_eq!(process.args, vec!["/bin/sh", "-c", "echo ok"]);

    // runtime.json lists the container
    let runtime_bytes = std::fs::read(store.root.path().join("runtime.json")).unwrap();
    assert_eq!(
        String::from_utf8_lossy(&runtime_bytes),
        format!(r#"{{"containers":["{id}"]}}"#)
    );
    assert!(runner.calls()[0].starts_with(&format!("create {runtime_id} -b ")));

    // created → running
    runtime.start_container("web").unwrap();
    assert!(matches!(
        runtime.start_container("web"),
        Err(RuntimeError::CannotStart(_, _))
    ));

    // running containers refuse removal without force
    assert!(matches!(
        runtime.remove_container(&mut distribution, "web", false),
        Err(RuntimeError::ContainerRunning(_))
    ));

    // once exited, removal tears down the bundle and the scratch node
    runner.set_status(&runtime_id, "exited");
    runtime
        .remove_container(&mut distribution, "web", false)
        .unwrap();
    assert!(!store.root.path().join("containers").join(&id).exists());
    assert!(!scratch_mount.exists());
    let runtime_bytes = std::fs::read(store.root.path().join("runtime.json")).unwrap();
    assert_eq!(
        String::from_utf8_lossy(&runtime_bytes),
        r#"{"containers":[]}"#
    );
}

#[test]
fn test_force_remove_running_container() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let runner = MockContainerRuntime::new();
    let mut runtime = store.open_runtime(&runner);
    let container = runtime
        .create_container(&mut distribution, CreateContainer::from_image("hello"))
        .unwrap();
    let id = container.id().to_string();
    runtime.start_container(&id).unwrap();

    runtime
        .remove_container(&mut distribution, &id, true)
        .unwrap();
    assert!(matches!(
        runtime.get_container(&id),
        Err(RuntimeError::ContainerUnknown(_))
    ));
    assert!(runner
        .calls()
        .iter()
        .any(|call| call.starts_with("delete force=true")));
}

#[test]
fn test_container_names_and_lookup() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let runner = MockContainerRuntime::new();
    let mut runtime = store.open_runtime(&runner);
    let container = runtime
        .create_container(
            &mut distribution,
            CreateContainer {
                image: "hello",
                name: Some("web"),
                command: None,
                workdir: None,
            },
        )
        .unwrap();
    let id = container.id().to_string();
    let runtime_id = container.runtime_id().to_string();

    // duplicate names are refused
    assert!(matches!(
        runtime.create_container(
            &mut distribution,
            CreateContainer {
                image: "hello",
                name: Some("web"),
                command: None,
                workdir: None,
            },
        ),
        Err(RuntimeError::NameInUse(_))
    ));

    // a second container gets a generated name distinct from taken ones
    let second = runtime
        .create_container(&mut distribution, CreateContainer::from_image("hello"))
        .unwrap();
    assert_ne!(second.name(), "web");
    let second_id = second.id().to_string();

    assert_eq!(runtime.get_container(&id).unwrap().name(), "web");
    assert_eq!(runtime.get_container(&runtime_id).unwrap().id(), id);
    assert_eq!(runtime.get_container("web").unwrap().id(), id);
    assert_eq!(runtime.containers().count(), 2);
    assert_ne!(second_id, id);
}

#[test]
fn test_containers_survive_reopen() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let runner = MockContainerRuntime::new();
    let mut runtime = store.open_runtime(&runner);
    let created = runtime
        .create_container(
            &mut distribution,
            CreateContainer {
                image: "hello",
                name: Some("web"),
                command: None,
                workdir: Some("/srv"),
            },
        )
        .unwrap();
    let id = created.id().to_string();
    drop(runtime);

    let runtime = store.open_runtime(&runner);
    let container = runtime.get_container("web").unwrap();
    assert_eq!(container.id(), id);
    assert_eq!(
        container.spec().process.as_ref().unwrap().cwd,
        "/srv".to_string()
    );
    // the runtime still knows it as created
    assert_eq!(runtime.status(container).unwrap(), "created");
}

#[test]
fn test_image_with_container_cannot_be_removed() {
    let store = TestStore::new();
    let mut distribution = store.open_distribution();
    let rootfs = store.make_rootfs_tar("hello");
    distribution
        .create_image("hello:latest", &rootfs, None)
        .unwrap();

    let runner = MockContainerRuntime::new();
    let mut runtime = store.open_runtime(&runner);
    runtime
        .create_container(&mut distribution, CreateContainer::from_image("hello"))
        .unwrap();

    // the scratch clone keeps the image's top layer in use
    assert!(matches!(
        distribution.remove_image("hello:latest"),
        Err(zoci::image::ImageError::ImageInUse(_))
    ));
}
