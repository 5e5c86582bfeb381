//! # containerd-shim-kvmbox-v1 - host shim
//!
//! Containerd spawns one shim process per container. This binary wires
//! the pieces together (network manager, event forwarding, the task
//! service) and parks until containerd tears it down. The TTRPC
//! transport adapter that binds [`kvmbox::host::task::ShimTaskService`]
//! to containerd's socket is part of packaging and lives outside this
//! crate's core.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use kvmbox::host::events::{ContainerdPublisher, EventForwarder};
use kvmbox::host::network::cni::CniConfig;
use kvmbox::host::network::metrics::NetworkMetrics;
use kvmbox::host::network::NetworkManager;
use kvmbox::host::task::ShimTaskService;

/// First guest CID handed out; 0–2 are reserved by the vsock spec.
const CID_BASE: u32 = 1024;

/// Flags containerd passes to v2 shims.
#[derive(Debug, Default)]
struct ShimFlags {
    namespace: String,
    address: String,
    id: String,
}

fn parse_flags() -> ShimFlags {
    let mut flags = ShimFlags::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-namespace" | "--namespace" => flags.namespace = args.next().unwrap_or_default(),
            "-address" | "--address" => flags.address = args.next().unwrap_or_default(),
            "-id" | "--id" => flags.id = args.next().unwrap_or_default(),
            _ => {}
        }
    }
    if flags.namespace.is_empty() {
        flags.namespace = "default".into();
    }
    flags
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let flags = parse_flags();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        container = %flags.id,
        namespace = %flags.namespace,
        "shim starting"
    );

    let metrics = Arc::new(NetworkMetrics::new());
    let network = Arc::new(NetworkManager::new(CniConfig::load(), metrics));

    let publisher = Arc::new(ContainerdPublisher {
        binary: which_containerd(),
        address: flags.address.clone(),
    });
    let events = Arc::new(EventForwarder::new(publisher));

    let next_cid = Arc::new(AtomicU32::new(CID_BASE));
    let service = ShimTaskService::new(
        flags.namespace.clone(),
        flags.id.clone(),
        network,
        Arc::clone(&events),
        Arc::new(move || next_cid.fetch_add(1, Ordering::SeqCst)),
    );

    // The TTRPC adapter binds `service` to the socket containerd handed
    // us; from the core's perspective the shim now serves until asked to
    // stop.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    service.shutdown().await;
    info!(container = %flags.id, "shim exiting");
    Ok(())
}

/// Locates the containerd binary for event publication.
fn which_containerd() -> std::path::PathBuf {
    if let Ok(path_env) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_env) {
            let candidate = dir.join("containerd");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    std::path::PathBuf::from("/usr/bin/containerd")
}
