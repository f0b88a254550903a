//! Runtime agent binary.
//!
//! Boots the runtime, sweeps orphaned TAPs left over from a previous
//! crash, and then idles until shutdown — the actual desired-state source
//! (control-plane polling, a gRPC surface, etc.) is out of scope for this
//! crate and is expected to be wired in by an embedding binary.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use zeitwork_runtime::allocator::tap_name;
use zeitwork_runtime::backend::FirecrackerBackend;
use zeitwork_runtime::image::OciLayoutImageSource;
use zeitwork_runtime::network::sweep_orphan_taps;
use zeitwork_runtime::{Config, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting zeitwork runtime agent");

    let config = Config::from_env();
    info!(
        base_dir = %config.base_dir.display(),
        firecracker_bin = %config.firecracker_bin.display(),
        bridge_name = %config.bridge_name,
        "configuration loaded"
    );

    let images_dir = config.base_dir.join("images-oci");
    let backend = Arc::new(FirecrackerBackend {
        firecracker_bin: config.firecracker_bin.clone(),
    });
    let image_source = Arc::new(OciLayoutImageSource::new(images_dir));

    let runtime = Arc::new(Runtime::new(config, backend, image_source));

    // On startup the registry is empty (it is rebuilt in-memory, not
    // persisted), so every existing `tap-zw-*` interface is an orphan from
    // a previous run.
    let live_taps: std::collections::HashSet<String> = runtime
        .list_instance_ids()
        .await
        .iter()
        .map(|id| tap_name(id))
        .collect();
    let removed = sweep_orphan_taps(&live_taps);
    if !removed.is_empty() {
        info!(count = removed.len(), "swept orphan TAP devices on startup");
    }

    info!("runtime agent ready, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");

    Ok(())
}
