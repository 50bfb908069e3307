mod cache;
mod cluster;
mod deploy;
mod mount;
mod server;
mod tokenfs;
mod tunnel;
mod unmount;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Port the in-cluster server listens on and the tunnel forwards to.
pub const ENDPOINT_PORT: u16 = 44044;

#[derive(Parser, Debug)]
#[command(name = "satokens", version, about = "Mount a Kubernetes service account token as a local file")]
struct Options {
    /// Path to a kubeconfig file; inferred from the environment when unset
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount the token to a local path
    Mount(mount::MountArgs),
    /// Run the remote http server that is connected to from the mount command
    #[command(hide = true)]
    Server(server::ServerArgs),
    /// Deploy the satokens pod to the cluster
    Deploy(deploy::DeployArgs),
    /// Remove the pod from the cluster
    Destroy(deploy::DestroyArgs),
}

/// Cancels `session` on the first SIGINT or SIGTERM and exits the process on
/// the second, for when the graceful teardown is stuck.
pub async fn shutdown_signal(session: CancellationToken) {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(forward_signals(tx));
    on_signals(rx, session, || {
        log::warn!("second shutdown signal received, exiting immediately");
        std::process::exit(1)
    })
    .await
}

async fn forward_signals(tx: mpsc::Sender<()>) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                log::warn!("unable to listen for SIGTERM: {e}");
                None
            }
        };

    loop {
        #[cfg(unix)]
        let terminated = async {
            match terminate.as_mut() {
                Some(sig) => {
                    sig.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    log::warn!("unable to listen for ctrl-c: {e}");
                    return;
                }
            }
            _ = terminated => {}
        }
        if tx.send(()).await.is_err() {
            return;
        }
    }
}

async fn on_signals(
    mut signals: mpsc::Receiver<()>,
    session: CancellationToken,
    force_exit: impl FnOnce(),
) {
    if signals.recv().await.is_none() {
        return;
    }
    log::info!("shutdown requested");
    session.cancel();

    if signals.recv().await.is_none() {
        return;
    }
    force_exit();
}

fn run(opts: Options) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let kubeconfig = opts.kubeconfig.as_deref();

    match opts.command {
        Command::Mount(args) => mount::run(&runtime, kubeconfig, args),
        Command::Server(args) => runtime.block_on(async {
            let session = CancellationToken::new();
            tokio::spawn(shutdown_signal(session.clone()));
            server::run(args, session).await
        }),
        Command::Deploy(args) => runtime.block_on(deploy::deploy(kubeconfig, args)),
        Command::Destroy(args) => runtime.block_on(deploy::destroy(kubeconfig, args)),
    }
}

fn main() -> ExitCode {
    let opts = Options::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&opts.log_level))
        .init();
    log::info!("starting");

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Options::command().debug_assert();
    }

    #[test]
    fn mount_defaults() {
        let opts = Options::try_parse_from(["satokens", "mount", "--pod-name", "agent"]).unwrap();
        let Command::Mount(args) = opts.command else {
            panic!("expected mount");
        };
        let rendered = format!("{args:?}");
        assert!(rendered.contains("pod_name: \"agent\""));
        assert!(rendered.contains("local_port: 44044"));
    }

    #[tokio::test]
    async fn second_signal_forces_exit() {
        let (tx, rx) = mpsc::channel(1);
        let session = CancellationToken::new();
        let (exited_tx, mut exited) = mpsc::channel(1);
        let watcher = tokio::spawn(on_signals(rx, session.clone(), move || {
            exited_tx.try_send(()).unwrap();
        }));

        tx.send(()).await.unwrap();
        session.cancelled().await;
        assert!(!watcher.is_finished());
        assert!(exited.try_recv().is_err());

        tx.send(()).await.unwrap();
        watcher.await.unwrap();
        assert!(exited.try_recv().is_ok());
    }

    #[tokio::test]
    async fn single_signal_only_cancels() {
        let (tx, rx) = mpsc::channel(1);
        let session = CancellationToken::new();
        let forced = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = std::sync::Arc::clone(&forced);
        let watcher = tokio::spawn(on_signals(rx, session.clone(), move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        tx.send(()).await.unwrap();
        drop(tx);
        watcher.await.unwrap();
        assert!(session.is_cancelled());
        assert!(!forced.load(std::sync::atomic::Ordering::SeqCst));
    }
}
