//! Creates and removes the agent pod that serves the token inside the cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Args;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodSpec, ProjectedVolumeSource, ServiceAccount,
    ServiceAccountTokenProjection, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};

use crate::ENDPOINT_PORT;
use crate::cluster;

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "satokens";
const TOKEN_VOLUME: &str = "sa-token";
const REPLACE_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Args, Debug)]
pub struct DeployArgs {
    #[arg(long, default_value = "satokens", env = "POD_NAME")]
    pod_name: String,

    /// Namespace to use for the pod
    #[arg(long, default_value = "default", env = "NAMESPACE")]
    namespace: String,

    /// Path of the token file inside the pod
    #[arg(long, default_value = "/var/run/secrets/satokens/token", env = "TOKEN_PATH")]
    path: PathBuf,

    /// Token expiration in seconds
    #[arg(long, visible_alias = "exp", default_value_t = 7200, env = "EXPIRATION")]
    expiration: i64,

    #[arg(long, visible_alias = "aud", default_value = "sts.amazonaws.com", env = "AUDIENCE")]
    audience: String,

    #[arg(long, default_value = concat!("ghcr.io/ekristen/satokens:", env!("CARGO_PKG_VERSION")), env = "IMAGE")]
    image: String,

    /// The name of the service account
    #[arg(long, default_value = "default", env = "SERVICE_ACCOUNT")]
    service_account_name: String,

    /// Create the service account if it doesn't exist
    #[arg(long, short = 'c', visible_alias = "create", env = "CREATE_SERVICE_ACCOUNT")]
    create_service_account: bool,

    // Older spelling of the flag above.
    #[arg(long = "create-sa", env = "CREATE_SA", hide = true)]
    create_sa: bool,

    /// Print the manifests instead of applying them
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    #[arg(long, default_value = "satokens", env = "POD_NAME")]
    pod_name: String,

    /// Namespace the pod runs in
    #[arg(long, default_value = "default", env = "NAMESPACE")]
    namespace: String,

    #[arg(long, default_value = "default", env = "SERVICE_ACCOUNT")]
    service_account_name: String,

    /// Also delete the service account
    #[arg(long)]
    delete_service_account: bool,
}

fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY.to_string(),
        )])),
        ..ObjectMeta::default()
    }
}

/// Splits the in-pod token path into the projected volume's mount directory
/// and the file name inside it.
fn split_token_path(path: &Path) -> anyhow::Result<(String, String)> {
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| anyhow!("token path {} has no file name", path.display()))?;
    let dir = path
        .parent()
        .and_then(|d| d.to_str())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| anyhow!("token path {} has no parent directory", path.display()))?;
    Ok((dir.to_string(), file.to_string()))
}

fn build_pod(args: &DeployArgs) -> anyhow::Result<Pod> {
    let (dir, file) = split_token_path(&args.path)?;

    Ok(Pod {
        metadata: metadata(&args.pod_name, &args.namespace),
        spec: Some(PodSpec {
            service_account_name: Some(args.service_account_name.clone()),
            containers: vec![Container {
                name: "server".to_string(),
                image: Some(args.image.clone()),
                command: Some(vec!["satokens".to_string()]),
                args: Some(vec![
                    "server".to_string(),
                    format!("--path={}", args.path.display()),
                ]),
                ports: Some(vec![ContainerPort {
                    name: Some("server".to_string()),
                    container_port: i32::from(ENDPOINT_PORT),
                    ..ContainerPort::default()
                }]),
                volume_mounts: Some(vec![VolumeMount {
                    name: TOKEN_VOLUME.to_string(),
                    mount_path: dir,
                    read_only: Some(true),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: TOKEN_VOLUME.to_string(),
                projected: Some(ProjectedVolumeSource {
                    sources: Some(vec![VolumeProjection {
                        service_account_token: Some(ServiceAccountTokenProjection {
                            path: file,
                            expiration_seconds: Some(args.expiration),
                            audience: Some(args.audience.clone()),
                            ..ServiceAccountTokenProjection::default()
                        }),
                        ..VolumeProjection::default()
                    }]),
                    ..ProjectedVolumeSource::default()
                }),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    })
}

fn build_service_account(args: &DeployArgs) -> Option<ServiceAccount> {
    (args.create_service_account || args.create_sa).then(|| ServiceAccount {
        metadata: metadata(&args.service_account_name, &args.namespace),
        ..ServiceAccount::default()
    })
}

/// Renders the objects as a multi-document YAML stream.
fn render(service_account: Option<&ServiceAccount>, pod: &Pod) -> anyhow::Result<String> {
    let mut docs = Vec::new();
    if let Some(sa) = service_account {
        docs.push(serde_yaml::to_string(sa)?);
    }
    docs.push(serde_yaml::to_string(pod)?);
    Ok(docs.join("---\n"))
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

pub async fn deploy(kubeconfig: Option<&Path>, args: DeployArgs) -> anyhow::Result<()> {
    let pod = build_pod(&args)?;
    let service_account = build_service_account(&args);

    if args.dry_run {
        print!("{}", render(service_account.as_ref(), &pod)?);
        return Ok(());
    }

    let client = cluster::client(kubeconfig).await?;

    if let Some(sa) = &service_account {
        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), &args.namespace);
        match accounts.create(&PostParams::default(), sa).await {
            Ok(_) => log::info!("created service account {}", args.service_account_name),
            Err(e) if is_status(&e, 409) => {
                log::info!("service account {} already exists", args.service_account_name)
            }
            Err(e) => return Err(e).context("unable to create service account"),
        }
    }

    // Pods are immutable, so an existing one is replaced rather than patched.
    let pods: Api<Pod> = Api::namespaced(client, &args.namespace);
    loop {
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => break,
            Err(e) if is_status(&e, 409) => {
                log::info!("replacing existing pod");
                match pods.delete(&args.pod_name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(e) if is_status(&e, 404) => {}
                    Err(e) => return Err(e).context("unable to delete existing pod"),
                }
                tokio::time::sleep(REPLACE_INTERVAL).await;
            }
            Err(e) => return Err(e).context("unable to create pod"),
        }
    }
    log::info!("creating pod {}/{}", args.namespace, args.pod_name);
    Ok(())
}

pub async fn destroy(kubeconfig: Option<&Path>, args: DestroyArgs) -> anyhow::Result<()> {
    let client = cluster::client(kubeconfig).await?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &args.namespace);
    match pods.delete(&args.pod_name, &DeleteParams::default()).await {
        Ok(_) => log::info!("deleted pod {}/{}", args.namespace, args.pod_name),
        Err(e) if is_status(&e, 404) => log::info!("pod {} not found", args.pod_name),
        Err(e) => return Err(e).context("unable to delete pod"),
    }

    if args.delete_service_account {
        let accounts: Api<ServiceAccount> = Api::namespaced(client, &args.namespace);
        match accounts
            .delete(&args.service_account_name, &DeleteParams::default())
            .await
        {
            Ok(_) => log::info!("deleted service account {}", args.service_account_name),
            Err(e) if is_status(&e, 404) => {
                log::info!("service account {} not found", args.service_account_name)
            }
            Err(e) => return Err(e).context("unable to delete service account"),
        }
    }

    log::info!("destruction successful");
    Ok(())
}
