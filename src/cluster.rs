//! Kubernetes access: client construction, pod readiness and port-forward
//! streams into the agent pod.

use std::future::Future;
use std::path::Path;

use k8s_openapi::api::core::v1::Pod;
use kube::config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Api, Client, Config};
use tokio::io::{AsyncRead, AsyncWrite};

pub const POD_RUNNING: &str = "Running";

#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("unable to load kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("unable to infer cluster config: {0}")]
    Infer(#[from] InferConfigError),
    #[error(transparent)]
    Api(#[from] kube::Error),
    #[error("port-forward returned no stream for port {0}")]
    MissingStream(u16),
}

/// Byte stream carried over an upgraded port-forward connection.
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// The remote process the tunnel forwards to.
pub trait PodConnector: Send + Sync + 'static {
    /// Current lifecycle phase as reported by the control plane.
    fn phase(&self) -> impl Future<Output = Result<String, KubeError>> + Send;

    /// Opens one authenticated, multiplexed stream to `port` on the pod.
    fn open_stream(
        &self,
        port: u16,
    ) -> impl Future<Output = Result<Box<dyn ForwardStream>, KubeError>> + Send;
}

pub async fn client(kubeconfig: Option<&Path>) -> Result<Client, KubeError> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

pub struct KubePod {
    pods: Api<Pod>,
    name: String,
}

impl KubePod {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        KubePod {
            pods: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

impl PodConnector for KubePod {
    async fn phase(&self) -> Result<String, KubeError> {
        let pod = self.pods.get(&self.name).await?;
        Ok(pod
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Unknown".to_string()))
    }

    async fn open_stream(&self, port: u16) -> Result<Box<dyn ForwardStream>, KubeError> {
        let mut forwarder = self.pods.portforward(&self.name, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or(KubeError::MissingStream(port))?;

        let pod = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                log::warn!("port-forward to {pod}:{port} ended with error: {e}");
            }
        });

        Ok(Box::new(stream))
    }
}
