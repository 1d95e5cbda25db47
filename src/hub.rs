// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::tunnel::BoxedConn;

mod crd;

pub use crd::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("loading kubeconfig: {0}")]
    Config(String),
    #[error("port-forward to pod {namespace}/{pod}: {reason}")]
    PortForward {
        namespace: String,
        pod: String,
        reason: String,
    },
}

/// Hub is the narrow read-only view of the hub cluster this crate needs. Lookups of single
/// objects return `None` when the object does not exist.
#[async_trait::async_trait]
pub trait Hub: Send + Sync {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    async fn managed_clusters(&self) -> Result<Vec<ManagedCluster>, Error>;

    async fn managed_cluster_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error>;

    async fn cluster_management_addon(
        &self,
        name: &str,
    ) -> Result<Option<ClusterManagementAddOn>, Error>;

    async fn managed_proxy_configuration(
        &self,
        name: &str,
    ) -> Result<Option<ManagedProxyConfiguration>, Error>;

    async fn managed_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedServiceAccount>, Error>;

    /// Names of the running pods matching `selector`.
    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error>;

    async fn port_forward(&self, namespace: &str, pod: &str, port: u16)
    -> Result<BoxedConn, Error>;
}

/// KubeHub implements [`Hub`] against a live API server.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

impl KubeHub {
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<String>) -> Result<Self, Error> {
        let options = KubeConfigOptions {
            context,
            cluster: None,
            user: None,
        };
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).map_err(|e| Error::Config(e.to_string()))?;
                Config::from_custom_kubeconfig(kc, &options)
                    .await
                    .map_err(|e| Error::Config(e.to_string()))?
            }
            None if options.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| Error::Config(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| Error::Config(e.to_string()))?,
        };
        debug!(cluster_url = %config.cluster_url, "connecting to hub");
        Ok(KubeHub {
            client: Client::try_from(config)?,
        })
    }

    pub fn new(client: Client) -> Self {
        KubeHub { client }
    }
}

#[async_trait::async_trait]
impl Hub for KubeHub {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn managed_clusters(&self) -> Result<Vec<ManagedCluster>, Error> {
        let api: Api<ManagedCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn managed_cluster_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error> {
        let api: Api<ManagedClusterAddOn> = Api::namespaced(self.client.clone(), cluster);
        Ok(api.get_opt(name).await?)
    }

    async fn cluster_management_addon(
        &self,
        name: &str,
    ) -> Result<Option<ClusterManagementAddOn>, Error> {
        let api: Api<ClusterManagementAddOn> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn managed_proxy_configuration(
        &self,
        name: &str,
    ) -> Result<Option<ManagedProxyConfiguration>, Error> {
        let api: Api<ManagedProxyConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn managed_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedServiceAccount>, Error> {
        let api: Api<ManagedServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(selector)).await?;
        Ok(pods
            .items
            .into_iter()
            .filter(|p| {
                p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
                    && p.metadata.deletion_timestamp.is_none()
            })
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxedConn, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = api.portforward(pod, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| Error::PortForward {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                reason: format!("no stream for port {port}"),
            })?;
        Ok(Box::new(PortForwardStream {
            stream: Box::new(stream),
            _forwarder: forwarder,
        }))
    }
}

// PortForwardStream keeps the forwarder alive for as long as its stream is in use.
struct PortForwardStream {
    stream: BoxedConn,
    _forwarder: kube::api::Portforwarder,
}

impl AsyncRead for PortForwardStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PortForwardStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
