//! Local port forward into the agent pod.
//!
//! A listener on the local address accepts connections and pipes each one
//! through its own port-forward stream. The session publishes its status on a
//! watch channel: `Ready` once the listener accepts connections, then `Closed`
//! on a stop request or `Failed` when the forward breaks. A failure also
//! cancels the owning session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cluster::{KubeError, POD_RUNNING, PodConnector};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("unable to forward port because pod is not running. Current status={0}")]
    NotRunning(String),
    #[error("unable to get pod: {0}")]
    Status(#[source] KubeError),
    #[error("unable to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("accepting local connection failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("unable to open port-forward stream: {0}")]
    Stream(#[source] KubeError),
    #[error("forward task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Starting,
    Ready,
    Closed,
    Failed(String),
}

/// Read side of a tunnel's status.
#[derive(Debug, Clone)]
pub struct TunnelWatch {
    rx: watch::Receiver<TunnelStatus>,
}

impl TunnelWatch {
    /// Waits until the tunnel has left `Starting`. Errors once it is closed
    /// or failed.
    pub async fn ready(&self) -> Result<(), String> {
        let mut rx = self.rx.clone();
        let status = rx
            .wait_for(|status| *status != TunnelStatus::Starting)
            .await
            .map_err(|_| "tunnel dropped before becoming ready".to_string())?;
        match &*status {
            TunnelStatus::Ready => Ok(()),
            TunnelStatus::Failed(reason) => Err(reason.clone()),
            TunnelStatus::Starting | TunnelStatus::Closed => Err("tunnel closed".to_string()),
        }
    }
}

pub fn status_channel() -> (watch::Sender<TunnelStatus>, TunnelWatch) {
    let (tx, rx) = watch::channel(TunnelStatus::Starting);
    (tx, TunnelWatch { rx })
}

pub struct TunnelSession {
    local_addr: SocketAddr,
    watch: TunnelWatch,
    stop: CancellationToken,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn watch(&self) -> TunnelWatch {
        self.watch.clone()
    }

    /// Stops forwarding and returns the forward's terminal error, if any.
    pub async fn close(self) -> Result<(), TunnelError> {
        self.stop.cancel();
        self.task.await?
    }
}

/// Forwards `local` to `remote_port` on the pod behind `connector`.
///
/// Fails immediately when the pod is not running. The forward runs until
/// `stop` is cancelled or the forward breaks, in which case `stop` is
/// cancelled on the caller's behalf.
pub async fn connect<C: PodConnector>(
    connector: C,
    local: SocketAddr,
    remote_port: u16,
    stop: CancellationToken,
) -> Result<TunnelSession, TunnelError> {
    let phase = connector.phase().await.map_err(TunnelError::Status)?;
    if phase != POD_RUNNING {
        return Err(TunnelError::NotRunning(phase));
    }

    let listener = TcpListener::bind(local)
        .await
        .map_err(|source| TunnelError::Bind {
            addr: local,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(TunnelError::Accept)?;

    let (status, watch) = status_channel();
    status.send_replace(TunnelStatus::Ready);
    log::info!("forwarding {local_addr} -> pod port {remote_port}");

    let task = tokio::spawn(forward(
        listener,
        Arc::new(connector),
        remote_port,
        status,
        stop.clone(),
    ));

    Ok(TunnelSession {
        local_addr,
        watch,
        stop,
        task,
    })
}

async fn forward<C: PodConnector>(
    listener: TcpListener,
    connector: Arc<C>,
    remote_port: u16,
    status: watch::Sender<TunnelStatus>,
    stop: CancellationToken,
) -> Result<(), TunnelError> {
    let mut conns: JoinSet<Result<(), TunnelError>> = JoinSet::new();

    let result = loop {
        tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    log::debug!("accepted tunnel connection from {peer}");
                    conns.spawn(pipe(Arc::clone(&connector), remote_port, conn));
                }
                Err(e) => break Err(TunnelError::Accept(e)),
            },
            Some(joined) = conns.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break Err(e),
                Err(e) => log::warn!("tunnel connection task failed: {e}"),
            },
        }
    };
    conns.abort_all();

    match &result {
        Ok(()) => {
            log::info!("tunnel stopped");
            status.send_replace(TunnelStatus::Closed);
        }
        Err(e) => {
            log::error!("tunnel failed: {e}");
            status.send_replace(TunnelStatus::Failed(e.to_string()));
            stop.cancel();
        }
    }
    result
}

async fn pipe<C: PodConnector>(
    connector: Arc<C>,
    remote_port: u16,
    mut conn: TcpStream,
) -> Result<(), TunnelError> {
    let mut upstream = connector
        .open_stream(remote_port)
        .await
        .map_err(TunnelError::Stream)?;

    // A single connection going wrong does not take the tunnel down.
    if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        log::debug!("tunnel connection closed with error: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::cluster::ForwardStream;

    /// Stands in for the pod: streams go to a local TCP backend.
    struct FakePod {
        phase: &'static str,
        backend: Option<SocketAddr>,
        opened: Arc<AtomicUsize>,
    }

    impl PodConnector for FakePod {
        async fn phase(&self) -> Result<String, KubeError> {
            Ok(self.phase.to_string())
        }

        async fn open_stream(&self, port: u16) -> Result<Box<dyn ForwardStream>, KubeError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let backend = self.backend.ok_or(KubeError::MissingStream(port))?;
            let stream = TcpStream::connect(backend)
                .await
                .map_err(|_| KubeError::MissingStream(port))?;
            Ok(Box::new(stream))
        }
    }

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut rd, mut wr) = conn.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    fn any_local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn refuses_pod_that_is_not_running() {
        let pod = FakePod {
            phase: "Pending",
            backend: None,
            opened: Arc::default(),
        };
        let connected = tokio::time::timeout(
            Duration::from_secs(1),
            connect(pod, any_local(), 44044, CancellationToken::new()),
        )
        .await
        .expect("connect blocked");

        match connected {
            Err(TunnelError::NotRunning(phase)) => assert_eq!(phase, "Pending"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("connected to a pending pod"),
        }
    }

    #[tokio::test]
    async fn forwards_bytes_to_the_pod() {
        let opened = Arc::new(AtomicUsize::new(0));
        let pod = FakePod {
            phase: POD_RUNNING,
            backend: Some(echo_backend().await),
            opened: Arc::clone(&opened),
        };
        let session = connect(pod, any_local(), 44044, CancellationToken::new())
            .await
            .unwrap();
        session.watch().ready().await.unwrap();

        for _ in 0..2 {
            let mut conn = TcpStream::connect(session.local_addr()).await.unwrap();
            conn.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
        assert_eq!(opened.load(Ordering::SeqCst), 2);

        let watch = session.watch();
        session.close().await.unwrap();
        assert_eq!(watch.ready().await.unwrap_err(), "tunnel closed");
    }

    #[tokio::test]
    async fn broken_forward_fails_the_session() {
        let pod = FakePod {
            phase: POD_RUNNING,
            backend: None,
            opened: Arc::default(),
        };
        let stop = CancellationToken::new();
        let session = connect(pod, any_local(), 44044, stop.clone())
            .await
            .unwrap();
        let watch = session.watch();

        let _conn = TcpStream::connect(session.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), stop.cancelled())
            .await
            .expect("session was not cancelled");

        let reason = watch.ready().await.unwrap_err();
        assert!(reason.contains("port-forward"), "unexpected reason: {reason}");
        assert!(matches!(
            session.close().await,
            Err(TunnelError::Stream(KubeError::MissingStream(44044)))
        ));
    }
}
