//! `satokens mount`: forward to the agent pod and serve its token as a file.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use fuser::MountOption;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::cache::{TokenCache, TunnelFetcher};
use crate::cluster::{self, KubePod};
use crate::tokenfs::{Owner, TokenFs};
use crate::tunnel::{self, TunnelError};
use crate::unmount::{SystemUnmounter, UnmountError, UnmountSupervisor};
use crate::{ENDPOINT_PORT, shutdown_signal};

#[derive(Args, Debug)]
pub struct MountArgs {
    #[arg(long, default_value = "satokens", env = "POD_NAME")]
    pod_name: String,

    /// Namespace the pod runs in
    #[arg(long, default_value = "default", env = "NAMESPACE")]
    namespace: String,

    #[arg(long, default_value = "/tmp/satokens", env = "MOUNT_PATH")]
    mount_path: PathBuf,

    /// Local port the tunnel listens on
    #[arg(long, default_value_t = ENDPOINT_PORT)]
    local_port: u16,

    /// Port the server listens on inside the pod
    #[arg(long, default_value_t = ENDPOINT_PORT)]
    remote_port: u16,

    /// Seconds to keep retrying a busy unmount
    #[arg(long, default_value_t = 15)]
    unmount_timeout: u64,

    /// Let other users read the mounted token
    #[arg(long)]
    allow_other: bool,
}

fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("satokens".to_string()),
        MountOption::NoAtime,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Blocks until the mount is torn down, either by a signal, a broken tunnel
/// or an external unmount.
pub fn run(runtime: &Runtime, kubeconfig: Option<&Path>, args: MountArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.mount_path)
        .with_context(|| format!("unable to create {}", args.mount_path.display()))?;
    let owner = Owner::of(&args.mount_path)
        .with_context(|| format!("unable to stat {}", args.mount_path.display()))?;

    let session = CancellationToken::new();
    let local = SocketAddr::from((Ipv4Addr::LOCALHOST, args.local_port));

    let tunnel = runtime.block_on(async {
        let client = cluster::client(kubeconfig).await?;
        let pod = KubePod::new(client, &args.namespace, &args.pod_name);
        let forward = tunnel::connect(pod, local, args.remote_port, session.clone())
            .await
            .context("unable to forward port")?;
        anyhow::Ok(forward)
    })?;

    runtime.spawn(shutdown_signal(session.clone()));

    let fetcher = TunnelFetcher::new(runtime.handle().clone(), tunnel.local_addr(), tunnel.watch())?;
    let fs = TokenFs::new(TokenCache::new(fetcher), owner);

    log::info!(
        "mounting {}/{} token at {}",
        args.namespace,
        args.pod_name,
        args.mount_path.display()
    );
    let mut supervisor = None;
    let mounted = fuser::Session::new(fs, &args.mount_path, &mount_options(args.allow_other))
        .and_then(|mut fuse| {
            // Only supervise once the kernel mount exists.
            let unmount = UnmountSupervisor::new(
                SystemUnmounter,
                &args.mount_path,
                Duration::from_secs(args.unmount_timeout),
            );
            supervisor = Some(runtime.spawn(unmount.supervise(session.clone())));
            fuse.run()
        });

    let unmounted = match supervisor {
        Some(task) if session.is_cancelled() => Some(
            runtime
                .block_on(task)
                .unwrap_or_else(|e| Err(UnmountError::Failed(format!("supervisor task failed: {e}")))),
        ),
        // Unmounted from outside: nothing left for the supervisor to do.
        Some(task) => {
            task.abort();
            None
        }
        None => None,
    };
    session.cancel();
    let forwarded = runtime.block_on(tunnel.close());

    teardown_result(&args.mount_path, mounted, unmounted, forwarded)?;
    log::info!("unmount complete");
    Ok(())
}

/// Folds every teardown step into one result. `unmounted` is `None` when the
/// supervisor had nothing to do.
fn teardown_result(
    mount_path: &Path,
    mounted: io::Result<()>,
    unmounted: Option<Result<u32, UnmountError>>,
    forwarded: Result<(), TunnelError>,
) -> anyhow::Result<()> {
    mounted.with_context(|| format!("unable to mount {}", mount_path.display()))?;
    if let Some(unmounted) = unmounted {
        unmounted.with_context(|| format!("unable to unmount {}", mount_path.display()))?;
    }
    forwarded.context("tunnel failed")?;
    Ok(())
}
