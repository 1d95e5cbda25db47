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

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::certs::{CertSource, CertificateBundle};
use crate::config::{Config, HealthCommand, KubectlCommand};
use crate::entrypoint::{EntryPoint, Provisioner};
use crate::health::{Prober, render_table};
use crate::hub::{Hub, KubeHub};
use crate::proxy::ReverseProxy;
use crate::tunnel::{KonnectivityDialer, TunnelDialer};
use crate::{discovery, kubeconfig};

/// Connects to the hub named by the kubeconfig flags.
pub async fn connect_hub(config: &Config) -> anyhow::Result<Arc<dyn Hub>> {
    let hub = KubeHub::connect(config.kubeconfig.as_deref(), config.context.clone())
        .await
        .context("connecting to the hub cluster")?;
    Ok(Arc::new(hub))
}

/// Tunnels bundles everything needed to open tunnels. The local entry point, when used, stays
/// open until this is dropped.
pub struct Tunnels {
    pub dialer: Arc<dyn TunnelDialer>,
    pub bundle: CertificateBundle,
    entry: Option<EntryPoint>,
}

impl Tunnels {
    pub async fn setup(config: &Config, hub: Arc<dyn Hub>) -> anyhow::Result<Tunnels> {
        let installation = discovery::installation(hub.as_ref()).await?;
        let source = match &config.cert_files {
            Some(files) => CertSource::Files(files.clone()),
            None => CertSource::Secrets {
                namespace: installation.namespace.clone(),
            },
        };
        let bundle = source
            .resolve(hub.as_ref())
            .await
            .context("loading proxy certificates")?;

        let mut endpoint = config.proxy_server.clone();
        let entry = if config.port_forward {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, endpoint.port));
            let entry = Provisioner::new(hub.clone(), installation.namespace.clone())
                .listen(addr)
                .await
                .context("port-forwarding to the proxy server")?;
            endpoint.port = entry.addr().port();
            Some(entry)
        } else {
            None
        };

        let tls = bundle
            .tunnel_tls(&endpoint)
            .context("building tunnel TLS configuration")?;
        info!(proxy_server = endpoint.authority(), "using proxy server");
        let dialer = KonnectivityDialer::new(endpoint, tls, config.dial_timeout);
        Ok(Tunnels {
            dialer: Arc::new(dialer),
            bundle,
            entry,
        })
    }

    pub fn close(self) {
        if let Some(entry) = self.entry {
            entry.close();
        }
    }
}

/// health probes the requested clusters and writes the table to `out`.
pub async fn health(
    config: &Config,
    cmd: &HealthCommand,
    hub: Arc<dyn Hub>,
    cancel: CancellationToken,
    out: &mut (dyn Write + Send),
) -> anyhow::Result<()> {
    let tunnels = Tunnels::setup(config, hub.clone()).await?;
    let prober = Prober::new(
        hub,
        tunnels.dialer.clone(),
        config.probe_timeout,
        cmd.concurrency,
        cancel,
    );
    let clusters = prober
        .clusters(&cmd.clusters)
        .await
        .context("listing managed clusters")?;
    debug!(count = clusters.len(), "probing clusters");
    let records = prober.probe_all(clusters).await;
    tunnels.close();
    let records = records?;
    out.write_all(render_table(&records).as_bytes())
        .context("writing health table")?;
    Ok(())
}

/// Where the kubectl binary is, resolved on `$PATH`.
pub fn find_kubectl() -> anyhow::Result<PathBuf> {
    which::which("kubectl").context("kubectl binary not found in $PATH")
}

/// kubectl runs `kubectl <args>` against the cluster through a local reverse proxy and returns
/// kubectl's exit status.
pub async fn kubectl(
    config: &Config,
    cmd: &KubectlCommand,
    hub: Arc<dyn Hub>,
    kubectl: &Path,
    cancel: CancellationToken,
) -> anyhow::Result<ExitStatus> {
    let token =
        discovery::service_account_token(hub.as_ref(), &cmd.cluster, &cmd.service_account)
            .await?;
    let tunnels = Tunnels::setup(config, hub).await?;
    let listener_tls = tunnels
        .bundle
        .listener_tls()
        .context("building listener TLS configuration")?;

    let proxy = ReverseProxy::bind(
        SocketAddr::from((Ipv4Addr::LOCALHOST, cmd.port)),
        listener_tls,
        cmd.cluster.clone(),
        tunnels.dialer.clone(),
    )
    .await
    .context("starting reverse proxy")?
    .with_idle_timeout(config.idle_timeout)
    .with_drain_timeout(config.drain_timeout);
    let port = proxy.local_addr().port();
    let stop = cancel.child_token();
    let serving = tokio::spawn(proxy.run(stop.clone()));

    let status = async {
        let file = kubeconfig::write_temp(
            &cmd.cluster,
            &kubeconfig::synthesize(&cmd.cluster, port, &token),
        )?;
        run_kubectl(kubectl, file.path(), &cmd.args, &cancel).await
    }
    .await;

    stop.cancel();
    if let Err(e) = serving.await {
        warn!("reverse proxy task failed: {e}");
    }
    tunnels.close();
    status
}

async fn run_kubectl(
    kubectl: &Path,
    kubeconfig: &Path,
    args: &[String],
    cancel: &CancellationToken,
) -> anyhow::Result<ExitStatus> {
    debug!(kubectl = %kubectl.display(), ?args, "running kubectl");
    let mut child = tokio::process::Command::new(kubectl)
        .arg("--kubeconfig")
        .arg(kubeconfig)
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("running {}", kubectl.display()))?;
    tokio::select! {
        status = child.wait() => Ok(status.context("waiting for kubectl")?),
        _ = cancel.cancelled() => {
            info!("interrupted, stopping kubectl");
            child.kill().await.context("stopping kubectl")?;
            Ok(child.wait().await.context("waiting for kubectl")?)
        }
    }
}
