use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::Result;
use crate::cli::RunArgs;
use crate::collab::{CollaborationManager, ManagerError, TcpTransport};
use crate::config::Config;
use crate::queue::MemoryQueue;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub(crate) fn handle(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        config.collab.listen_addr = listen;
    }
    if let Some(advertise) = args.advertise {
        config.collab.advertise_addr = Some(advertise);
    }
    if !args.peers.is_empty() {
        config.collab.peers = args.peers;
    }
    let manager_config = config.manager_config()?;
    let peers = manager_config.peers.clone();

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone());
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone());

    let queue = Arc::new(MemoryQueue::new(args.queue_capacity));
    let handle = CollaborationManager::start(Arc::new(TcpTransport), queue, manager_config)?;
    tracing::info!(
        listen = %handle.local_addr(),
        local = %handle.manager().local_address(),
        "node running"
    );

    if !args.no_startup_sync && !peers.is_empty() {
        let report = handle
            .manager()
            .synchronize_with_peers(&peers, config.collab.startup_sync_timeout());
        tracing::info!(
            linked = report.linked.len(),
            failed = report.failed.len(),
            "startup synchronization finished"
        );
    }

    while !shutdown.load(Ordering::Relaxed) && handle.fatal().is_none() {
        thread::sleep(SHUTDOWN_POLL);
    }

    let fatal = handle.fatal();
    handle.shutdown();
    match fatal {
        Some(alert) => Err(ManagerError::Stopped(alert).into()),
        None => Ok(()),
    }
}
