//! ceph-volume-driver daemon entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ceph_volume_driver::config::Config;
use ceph_volume_driver::exec::SystemRunner;
use ceph_volume_driver::keyring::host_key_cache;
use ceph_volume_driver::mount::MountManager;
use ceph_volume_driver::plugin::{PluginService, VolumePlugin};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: ceph-volume-driver <config.yaml>");
    eprintln!();
    eprintln!("ceph-volume-driver - CephFS volumes for container runtimes");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  ceph-volume-driver /etc/ceph-volume-driver/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ceph-volume-driver starting");
    info!("Loaded configuration from {:?}", config_path);
    info!("Mounting volumes under {:?}", config.mount_root);

    // Reconciliation runs before anything can be served
    let manager = tokio::task::spawn_blocking(move || {
        MountManager::start(&config, Arc::new(SystemRunner), host_key_cache())
    })
    .await?;

    let service = PluginService::new(Arc::new(manager));
    for volume in service.list().await? {
        info!("Known volume {} at {:?}", volume.name, volume.mountpoint);
    }
    info!("Volume scope: {}", service.capabilities().scope);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Ready; press Ctrl+C to exit");

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    // Containers keep their mounts; the next start picks them up again
    let active = service.list().await?;
    if !active.is_empty() {
        warn!("Leaving {} volume(s) mounted for running containers", active.len());
    }
    info!("Exiting");

    Ok(())
}
