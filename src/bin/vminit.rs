//! # vminit - guest init for kvmbox microVMs
//!
//! Runs as PID 1 inside the VM and hosts the guest half of the shim:
//!
//! - **RPC server**: task, stdio, events, and system services over vsock
//! - **Zombie reaping**: collects orphaned children, feeds exits that
//!   bypass the per-process waiters back into the task service
//! - **Signal handling**: SIGTERM/SIGINT shut the services down
//! - **DNS bootstrap**: extracts nameservers from the kernel `ip=`
//!   parameter and writes /etc/resolv.conf
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ VM                                                           │
//! │  vminit (PID 1)                                              │
//! │  ├─► vsock server (port 2962): task / stdio / events / info  │
//! │  ├─► OCI runtime (crun) drives container processes           │
//! │  ├─► zombie reap → exit tracker → event stream               │
//! │  └─► resolv.conf from kernel cmdline                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Building
//!
//! ```bash
//! cargo build --release --bin vminit --target x86_64-unknown-linux-musl
//! ```

// =============================================================================
// Non-Linux Stub
// =============================================================================

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("vminit is only available on Linux");
    eprintln!("Build with: cargo build --target x86_64-unknown-linux-musl");
    std::process::exit(1);
}

// =============================================================================
// Linux Implementation
// =============================================================================

#[cfg(target_os = "linux")]
fn main() -> std::process::ExitCode {
    linux::main()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::process::ExitCode;
    use std::sync::Arc;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, error, info, warn, Level};
    use tracing_subscriber::FmtSubscriber;

    use kvmbox::constants::GUEST_VSOCK_PORT;
    use kvmbox::guest::events::EventExchange;
    use kvmbox::guest::runtime::CommandRuntime;
    use kvmbox::guest::server::{self, GuestServices};
    use kvmbox::guest::stdio::StdioManager;
    use kvmbox::guest::task::TaskService;
    use kvmbox::protocol::ExitRecord;

    /// Guest-side state root for the OCI runtime.
    const RUNTIME_ROOT: &str = "/run/kvmbox";

    /// Scratch dir for pid files and exec documents.
    const WORK_DIR: &str = "/run/kvmbox/work";

    /// Where transferred bundles are materialized.
    const BUNDLES_DIR: &str = "/run/kvmbox/bundles";

    /// Containerd namespace stamped on published events.
    const EVENT_NAMESPACE: &str = "default";

    const EXIT_SUCCESS: u8 = 0;
    const EXIT_INIT_FAILED: u8 = 1;

    pub fn main() -> ExitCode {
        main_async()
    }

    #[tokio::main]
    async fn main_async() -> ExitCode {
        run().await
    }

    async fn run() -> ExitCode {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_target(false)
            .with_ansi(false)
            .compact()
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("failed to set tracing subscriber");
            return ExitCode::from(EXIT_INIT_FAILED);
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "vminit starting"
        );
        if std::process::id() != 1 {
            warn!(
                pid = std::process::id(),
                "vminit is not PID 1, zombie reaping may not work"
            );
        }

        if let Err(err) = write_resolv_conf().await {
            warn!(error = %err, "failed to write resolv.conf from kernel cmdline");
        }

        let runtime = match CommandRuntime::discover(RUNTIME_ROOT, WORK_DIR) {
            Ok(runtime) => Arc::new(runtime),
            Err(err) => {
                error!(error = %err, "no OCI runtime available");
                return ExitCode::from(EXIT_INIT_FAILED);
            }
        };

        let events = Arc::new(EventExchange::new());
        let task = TaskService::new(
            EVENT_NAMESPACE,
            BUNDLES_DIR,
            runtime,
            Arc::new(StdioManager::new()),
            Arc::clone(&events),
        );
        let services = Arc::new(GuestServices::new(Arc::clone(&task), events));

        let shutdown = CancellationToken::new();
        spawn_reaper(Arc::clone(&task));

        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                return ExitCode::from(EXIT_INIT_FAILED);
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGINT handler");
                return ExitCode::from(EXIT_INIT_FAILED);
            }
        };

        let server = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server::serve(GUEST_VSOCK_PORT, services, shutdown).await })
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            result = server => {
                match result {
                    Ok(Ok(())) => info!("RPC server exited"),
                    Ok(Err(err)) => {
                        error!(error = %err, "RPC server failed");
                        return ExitCode::from(EXIT_INIT_FAILED);
                    }
                    Err(err) => {
                        error!(error = %err, "RPC server panicked");
                        return ExitCode::from(EXIT_INIT_FAILED);
                    }
                }
                return ExitCode::from(EXIT_SUCCESS);
            }
        }

        shutdown.cancel();
        ExitCode::from(EXIT_SUCCESS)
    }

    /// Reaps zombies on SIGCHLD and routes exits that the per-process
    /// waiters missed (re-parented orphans, lost wait races) into the
    /// task service.
    fn spawn_reaper(task: Arc<TaskService>) {
        tokio::spawn(async move {
            let mut sigchld =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
                    Ok(signal) => signal,
                    Err(err) => {
                        error!(error = %err, "failed to install SIGCHLD handler");
                        return;
                    }
                };
            loop {
                sigchld.recv().await;
                // Give the runtime's own waiters a beat to collect their
                // children before sweeping.
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                while let Some((pid, status)) = reap_zombie() {
                    debug!(pid, status, "reaped process");
                    task.notify_exit(ExitRecord {
                        pid,
                        status,
                        exited_at: Utc::now(),
                    })
                    .await;
                }
            }
        });
    }

    /// Reaps one zombie; returns (pid, exit status) if any was waiting.
    fn reap_zombie() -> Option<(i32, i32)> {
        let mut status: i32 = 0;
        // SAFETY: waitpid with WNOHANG is safe; -1 means any child.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return None;
        }
        let code = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            1
        };
        Some((pid, code))
    }

    /// Extracts DNS servers from the kernel `ip=` parameter and writes
    /// /etc/resolv.conf. Format:
    /// `ip=<client>:<server>:<gw>:<netmask>:<hostname>:<dev>:<autoconf>:<dns0>:<dns1>`.
    async fn write_resolv_conf() -> std::io::Result<()> {
        let cmdline = tokio::fs::read_to_string("/proc/cmdline").await?;
        let Some(servers) = parse_dns_from_cmdline(&cmdline) else {
            debug!("no DNS servers in kernel cmdline");
            return Ok(());
        };

        let mut contents = String::new();
        for server in &servers {
            contents.push_str("nameserver ");
            contents.push_str(server);
            contents.push('\n');
        }
        tokio::fs::write("/etc/resolv.conf", contents).await?;
        info!(?servers, "resolv.conf written from kernel cmdline");
        Ok(())
    }

    fn parse_dns_from_cmdline(cmdline: &str) -> Option<Vec<String>> {
        let ip_param = cmdline
            .split_whitespace()
            .find_map(|p| p.strip_prefix("ip="))?;
        let fields: Vec<&str> = ip_param.split(':').collect();
        // dns0 and dns1 are fields 8 and 9.
        let mut servers = Vec::new();
        for field in fields.iter().skip(7).take(2) {
            if !field.is_empty() {
                servers.push((*field).to_string());
            }
        }
        if servers.is_empty() {
            None
        } else {
            Some(servers)
        }
    }

}
