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

//! Probes the API server of managed clusters through the tunnel.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use hyper::header::HOST;
use hyper::{Request, StatusCode};
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::discovery::ADDON_NAME;
use crate::hub::{self, Hub, is_condition_true};
use crate::hyper_util::{empty, http1_client};
use crate::tls::{self, ALPN_HTTP1};
use crate::tunnel::{self, API_SERVER_PORT, TunnelDialer};

const HEALTHZ_PATH: &str = "/healthz";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbedHealth {
    True,
    False,
    Unknown,
}

impl fmt::Display for ProbedHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbedHealth::True => "True",
            ProbedHealth::False => "False",
            ProbedHealth::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Latency {
    Measured(Duration),
    /// The dial through the tunnel timed out.
    Timeout,
    None,
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Measured(d) => write!(f, "{d:?}"),
            Latency::Timeout => f.write_str("<timeout>"),
            Latency::None => f.write_str("<none>"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterHealthRecord {
    pub cluster: String,
    pub installed: bool,
    pub available: bool,
    pub probed_health: ProbedHealth,
    pub latency: Latency,
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Tunnel(#[from] tunnel::Error),
    #[error("tls: {0}")]
    Tls(#[from] tls::Error),
    #[error("tls handshake: {0}")]
    Handshake(#[source] std::io::Error),
    #[error("http: {0}")]
    Http(#[from] hyper::Error),
    #[error("building request: {0}")]
    Request(#[from] http::Error),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("health check cancelled")]
    Cancelled,
}

/// Prober checks clusters one tunnel per cluster.
pub struct Prober {
    hub: Arc<dyn Hub>,
    dialer: Arc<dyn TunnelDialer>,
    probe_timeout: Duration,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Prober {
    pub fn new(
        hub: Arc<dyn Hub>,
        dialer: Arc<dyn TunnelDialer>,
        probe_timeout: Duration,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Prober {
            hub,
            dialer,
            probe_timeout,
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// The clusters to probe: `requested` when given, otherwise every managed cluster.
    pub async fn clusters(&self, requested: &[String]) -> Result<Vec<String>, hub::Error> {
        if !requested.is_empty() {
            return Ok(requested.to_vec());
        }
        Ok(self
            .hub
            .managed_clusters()
            .await?
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect())
    }

    /// Probes every cluster, at most `concurrency` at a time. Records come back in input order.
    /// Cancellation stops the scan and fails it; partial results are discarded.
    pub async fn probe_all(
        &self,
        clusters: Vec<String>,
    ) -> Result<Vec<ClusterHealthRecord>, ProbeError> {
        let records: Vec<_> = stream::iter(clusters)
            .map(|cluster| self.probe(cluster))
            .buffered(self.concurrency)
            .take_until(self.cancel.cancelled())
            .collect()
            .await;
        if self.cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        Ok(records)
    }

    pub async fn probe(&self, cluster: String) -> ClusterHealthRecord {
        let span = info_span!("probe", %cluster);
        async {
            let (installed, available) = self.addon_state(&cluster).await;
            let start = Instant::now();
            let result = match tokio::time::timeout(
                self.probe_timeout,
                healthz(self.dialer.as_ref(), &cluster, self.cancel.child_token()),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(ProbeError::Timeout(self.probe_timeout)),
            };
            if let Err(e) = &result {
                debug!("probe failed: {e}");
            }
            let (probed_health, latency) = classify(&result, start.elapsed());
            ClusterHealthRecord {
                cluster: cluster.clone(),
                installed,
                available,
                probed_health,
                latency,
            }
        }
        .instrument(span)
        .await
    }

    async fn addon_state(&self, cluster: &str) -> (bool, bool) {
        match self.hub.managed_cluster_addon(cluster, ADDON_NAME).await {
            Ok(Some(addon)) => {
                let available = addon
                    .status
                    .as_ref()
                    .is_some_and(|s| is_condition_true(&s.conditions, "Available"));
                (true, available)
            }
            Ok(None) => (false, false),
            Err(e) => {
                warn!(cluster, "reading ManagedClusterAddOn failed: {e}");
                (false, false)
            }
        }
    }
}

/// healthz fetches `/healthz` from the cluster's API server over a fresh tunnel. Any response
/// that arrives is returned, whatever its status.
async fn healthz(
    dialer: &dyn TunnelDialer,
    cluster: &str,
    cancel: CancellationToken,
) -> Result<(StatusCode, Bytes), ProbeError> {
    let tunnel = dialer.open(cancel).await?;
    let conn = tunnel
        .dial("tcp", &format!("{cluster}:{API_SERVER_PORT}"))
        .await?;
    let tls = tls::insecure_client_config(cluster, &[ALPN_HTTP1])?
        .connect(conn)
        .await
        .map_err(ProbeError::Handshake)?;
    let mut sender = http1_client(tls, tunnel, cluster.to_string()).await?;
    let req = Request::get(HEALTHZ_PATH).header(HOST, cluster).body(empty())?;
    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    if !status.is_success() {
        debug!(%status, "healthz answered with an error status");
    }
    Ok((status, body))
}

/// classify turns a probe outcome into the reported health and latency. A received response is
/// `True` only for the body `ok`; only failing to get a response is `Unknown`.
pub fn classify(
    result: &Result<(StatusCode, Bytes), ProbeError>,
    elapsed: Duration,
) -> (ProbedHealth, Latency) {
    match result {
        Ok((_, body)) if body.as_ref() == b"ok" => (ProbedHealth::True, Latency::Measured(elapsed)),
        Ok(_) => (ProbedHealth::False, Latency::Measured(elapsed)),
        Err(e) if mentions_dial_timeout(e) => (ProbedHealth::Unknown, Latency::Timeout),
        Err(_) => (ProbedHealth::Unknown, Latency::None),
    }
}

fn mentions_dial_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.to_string().contains("dial timeout") {
            return true;
        }
        current = e.source();
    }
    false
}

fn title(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

/// render_table formats records as left-aligned columns separated by three spaces.
pub fn render_table(records: &[ClusterHealthRecord]) -> String {
    let header = [
        "CLUSTER NAME",
        "INSTALLED",
        "AVAILABLE",
        "PROBED HEALTH",
        "LATENCY",
    ]
    .map(str::to_string);
    let rows: Vec<[String; 5]> = std::iter::once(header)
        .chain(records.iter().map(|r| {
            [
                r.cluster.clone(),
                title(r.installed).to_string(),
                title(r.available).to_string(),
                r.probed_health.to_string(),
                r.latency.to_string(),
            ]
        }))
        .collect();
    let widths: Vec<usize> = (0..5)
        .map(|i| rows.iter().map(|r| r[i].len()).max().unwrap_or(0))
        .collect();
    let mut out = String::new();
    for row in &rows {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .join("   ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
