//! Integration tests for the public `Runtime` lifecycle surface.
//!
//! The suite deliberately never points `Config::base_rootfs_path` at a
//! real ext4 image: loop-mounting requires root and a kernel loop driver,
//! neither of which this test sandbox has. Every scenario here exercises
//! the contract the public API makes regardless of that — idempotency,
//! error taxonomy, and rollback — using `MockBackend` for the VMM seam.

use std::path::PathBuf;
use std::sync::Arc;

use zeitwork_runtime::backend::MockBackend;
use zeitwork_runtime::image::OciLayoutImageSource;
use zeitwork_runtime::{Config, InstanceSpec, NetworkConfig, Resources, Runtime, RuntimeError};

fn test_config(base_dir: PathBuf) -> Config {
    Config {
        base_dir: base_dir.clone(),
        firecracker_bin: PathBuf::from("/usr/bin/firecracker"),
        base_rootfs_path: base_dir.join("no-such-base.ext4"),
        kernel_path: base_dir.join("vmlinux"),
        bridge_name: "br-zeitwork-test".to_string(),
    }
}

fn test_spec(id: &str) -> InstanceSpec {
    InstanceSpec {
        id: id.to_string(),
        image_tag: "localhost:5000/hello:v1".to_string(),
        image_id: "sha256:deadbeef".to_string(),
        resources: Resources { vcpus: 1, memory_mib: 128 },
        environment: vec![("PORT".to_string(), "3000".to_string())],
        network_config: NetworkConfig { default_port: 3000 },
    }
}

fn test_runtime(tmp: &std::path::Path) -> Runtime {
    let config = test_config(tmp.to_path_buf());
    let image_source = Arc::new(OciLayoutImageSource::new(tmp.to_path_buf()));
    Runtime::new(config, Arc::new(MockBackend::new()), image_source)
}

/// P3 (partial — the network/rootfs legs are out of sandbox reach):
/// a `Create` that fails leaves no registry entry and no instance
/// directory behind, matching the pre-`Create` host state.
#[tokio::test]
async fn create_failure_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = test_runtime(tmp.path());

    let result = runtime.create(test_spec("i-001")).await;
    assert!(result.is_err());

    assert!(runtime.get_state("i-001").await.is_err());
    assert!(runtime.list_instances().await.is_empty());
    assert!(!tmp.path().join("instances/i-001").exists());
}

/// P4: `Delete` is idempotent — calling it twice on an instance that was
/// never successfully created (and so never registered) produces the same
/// terminal observation both times.
#[tokio::test]
async fn delete_is_idempotent_on_repeated_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = test_runtime(tmp.path());

    runtime.delete("i-001").await.unwrap();
    runtime.delete("i-001").await.unwrap();
    assert!(runtime.get_state("i-001").await.is_err());
}

/// Every lifecycle read operation on an unknown id reports
/// `ResourceNotFound`, never a panic or a default value.
#[tokio::test]
async fn unknown_id_is_resource_not_found_everywhere() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = test_runtime(tmp.path());

    assert!(matches!(
        runtime.get_state("nope").await,
        Err(RuntimeError::ResourceNotFound(_))
    ));
    assert!(matches!(
        runtime.start("nope").await,
        Err(RuntimeError::ResourceNotFound(_))
    ));
    assert!(matches!(
        runtime.stop("nope").await,
        Err(RuntimeError::ResourceNotFound(_))
    ));
    assert!(matches!(
        runtime.get_logs("nope", 10).await,
        Err(RuntimeError::ResourceNotFound(_))
    ));
}

/// `ExecuteCommand` is deliberately unsupported by this runtime
/// (`spec.md` §4.A).
#[tokio::test]
async fn execute_command_is_not_supported() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = test_runtime(tmp.path());

    let result = runtime.execute_command("anything", &[]).await;
    assert!(matches!(result, Err(RuntimeError::NotSupported)));
}

/// Concurrent `Create`s on distinct ids that all hit the same rootfs
/// failure each roll back independently — one instance's failure can't
/// leak into another's bookkeeping.
#[tokio::test]
async fn concurrent_creates_on_distinct_ids_roll_back_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(test_runtime(tmp.path()));

    let mut handles = Vec::new();
    for i in 0..16 {
        let runtime = runtime.clone();
        let id = format!("i-{i:03}");
        handles.push(tokio::spawn(async move { runtime.create(test_spec(&id)).await }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    assert!(runtime.list_instances().await.is_empty());
}
