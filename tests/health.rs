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

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use clusterproxy::app;
use clusterproxy::config::{Config, HealthCommand};
use clusterproxy::test_helpers::apiserver::ApiServerStub;
use clusterproxy::test_helpers::hub::FakeHub;
use clusterproxy::test_helpers::konnectivity::FakeProxyServer;
use clusterproxy::test_helpers::{self, Backends, TestPki};
use clusterproxy::tls;

const NAMESPACE: &str = "open-cluster-management-cluster-proxy";

#[ctor::ctor]
fn install_crypto_provider() {
    tls::install_default_provider();
}

fn config(server: &FakeProxyServer) -> Config {
    Config {
        kubeconfig: None,
        context: None,
        cert_files: None,
        in_cluster_cert_lookup: true,
        proxy_server: server.endpoint(),
        port_forward: false,
        dial_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(90),
        drain_timeout: Duration::from_secs(1),
    }
}

async fn run(config: &Config, hub: Arc<FakeHub>, clusters: &[&str]) -> anyhow::Result<String> {
    let cmd = HealthCommand {
        clusters: clusters.iter().map(|c| c.to_string()).collect(),
        concurrency: 1,
    };
    let mut out = Vec::new();
    app::health(config, &cmd, hub, CancellationToken::new(), &mut out).await?;
    Ok(String::from_utf8(out)?)
}

fn rows(table: &str) -> Vec<Vec<String>> {
    table
        .lines()
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .collect()
}

#[tokio::test]
async fn installed_and_missing_clusters() {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    let backends = Backends::default();
    backends.serve("cluster-a:443", ApiServerStub::new());
    let server = FakeProxyServer::spawn(&pki, backends).await;

    let hub = Arc::new(FakeHub::default());
    hub.install_addon(NAMESPACE);
    hub.add_proxy_secrets(NAMESPACE, &pki);
    hub.add_managed_cluster("cluster-a", Some(true));

    let table = run(&config(&server), hub, &["cluster-a", "cluster-b"])
        .await
        .unwrap();
    let rows = rows(&table);
    assert_eq!(rows.len(), 3, "{table}");
    assert_eq!(
        rows[0],
        vec!["CLUSTER", "NAME", "INSTALLED", "AVAILABLE", "PROBED", "HEALTH", "LATENCY"]
    );
    assert_eq!(rows[1][..4], ["cluster-a", "True", "True", "True"]);
    assert!(
        humantime_like(&rows[1][4]),
        "latency should be a duration: {table}"
    );
    assert_eq!(rows[2], ["cluster-b", "False", "False", "Unknown", "<none>"]);
    assert_eq!(server.dials(), vec!["cluster-a:443", "cluster-b:443"]);
}

#[tokio::test]
async fn all_managed_clusters_by_default() {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    let backends = Backends::default();
    backends
        .serve("c1:443", ApiServerStub::new())
        .unresponsive("c2:443");
    let server = FakeProxyServer::spawn(&pki, backends).await;

    let hub = Arc::new(FakeHub::default());
    hub.install_addon(NAMESPACE);
    hub.add_proxy_secrets(NAMESPACE, &pki);
    hub.add_managed_cluster("c1", Some(true));
    hub.add_managed_cluster("c2", Some(false));

    let table = run(&config(&server), hub, &[]).await.unwrap();
    let rows = rows(&table);
    assert_eq!(rows.len(), 3, "{table}");
    assert_eq!(rows[1][..4], ["c1", "True", "True", "True"]);
    assert_eq!(rows[2], ["c2", "True", "False", "Unknown", "<timeout>"]);
}

#[tokio::test]
async fn addon_not_installed_is_fatal() {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    let server = FakeProxyServer::spawn(&pki, Backends::default()).await;
    let hub = Arc::new(FakeHub::default());

    let err = run(&config(&server), hub, &["cluster-a"])
        .await
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("Cluster-Proxy addon is not installed"),
        "{err:#}"
    );
    assert_eq!(server.streams(), 0);
}

#[tokio::test]
async fn missing_proxy_secret_is_fatal() {
    test_helpers::initialize_telemetry();
    let pki = TestPki::generate(&["127.0.0.1"]);
    let server = FakeProxyServer::spawn(&pki, Backends::default()).await;
    let hub = Arc::new(FakeHub::default());
    hub.install_addon(NAMESPACE);
    hub.add_proxy_secrets(NAMESPACE, &pki);
    hub.remove_secret(NAMESPACE, "proxy-client");

    let err = run(&config(&server), hub, &["cluster-a"])
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("proxy-client"), "{err:#}");
}

// Durations render through Debug, e.g. `12.3ms` or `1.2s`.
fn humantime_like(s: &str) -> bool {
    let digits = s.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == 'µ');
    !digits.is_empty() && digits.len() < s.len() && digits.parse::<f64>().is_ok()
}
