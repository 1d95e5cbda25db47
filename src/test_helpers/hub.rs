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

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use tokio::io::AsyncWriteExt;

use crate::certs::{CA_SECRET, CLIENT_SECRET, SERVER_SECRET};
use crate::discovery::ADDON_NAME;
use crate::hub::{
    ClusterManagementAddOn, ClusterManagementAddOnSpec, Condition, Error, Hub, ManagedCluster,
    ManagedClusterAddOn, ManagedClusterAddOnSpec, ManagedClusterAddOnStatus, ManagedClusterSpec,
    ManagedProxyConfiguration, ManagedProxyConfigurationSpec, ManagedServiceAccount,
    ManagedServiceAccountSpec, ManagedServiceAccountStatus, ProxyServerSpec, SecretRef,
};
use crate::tls::mock::TestPki;
use crate::tunnel::BoxedConn;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Objects {
    secrets: HashMap<Key, Secret>,
    clusters: Vec<ManagedCluster>,
    addons: HashMap<Key, ManagedClusterAddOn>,
    cluster_management_addon: Option<ClusterManagementAddOn>,
    configurations: HashMap<String, ManagedProxyConfiguration>,
    service_accounts: HashMap<Key, ManagedServiceAccount>,
    pods: HashMap<String, Vec<String>>,
    failure: Option<String>,
}

/// FakeHub is an in-memory [`Hub`]. Port-forwards connect to a stream that writes
/// `<pod>:<port>` and closes, so tests can see which pod was picked.
#[derive(Default)]
pub struct FakeHub {
    objects: Mutex<Objects>,
    calls: AtomicUsize,
}

impl FakeHub {
    pub fn add_secret(&self, namespace: &str, name: &str, secret: Secret) {
        self.objects
            .lock()
            .unwrap()
            .secrets
            .insert(key(namespace, name), secret);
    }

    pub fn remove_secret(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .secrets
            .remove(&key(namespace, name));
    }

    /// Stores the add-on secrets holding the material of `pki`.
    pub fn add_proxy_secrets(&self, namespace: &str, pki: &TestPki) {
        let secret = |pairs: &[(&str, &str)]| Secret {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.add_secret(namespace, CA_SECRET, secret(&[("ca.crt", &pki.ca_cert)]));
        self.add_secret(
            namespace,
            SERVER_SECRET,
            secret(&[("tls.crt", &pki.server_cert), ("tls.key", &pki.server_key)]),
        );
        self.add_secret(
            namespace,
            CLIENT_SECRET,
            secret(&[("tls.crt", &pki.client_cert), ("tls.key", &pki.client_key)]),
        );
    }

    /// Every API read fails with `message` from now on. Port-forwards keep working.
    pub fn fail_all(&self, message: &str) {
        self.objects.lock().unwrap().failure = Some(message.to_string());
    }

    /// Number of API reads served, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Registers the add-on with its default configuration, running the proxy server in
    /// `namespace`.
    pub fn install_addon(&self, namespace: &str) {
        self.set_cluster_management_addon(ClusterManagementAddOn::new(
            ADDON_NAME,
            ClusterManagementAddOnSpec::default(),
        ));
        self.add_proxy_configuration(ADDON_NAME, namespace);
    }

    pub fn set_cluster_management_addon(&self, addon: ClusterManagementAddOn) {
        self.objects.lock().unwrap().cluster_management_addon = Some(addon);
    }

    pub fn add_proxy_configuration(&self, name: &str, namespace: &str) {
        let config = ManagedProxyConfiguration::new(
            name,
            ManagedProxyConfigurationSpec {
                proxy_server: ProxyServerSpec {
                    namespace: namespace.to_string(),
                },
            },
        );
        self.objects
            .lock()
            .unwrap()
            .configurations
            .insert(name.to_string(), config);
    }

    /// Adds a managed cluster. `addon` is `None` when the add-on is not installed on it,
    /// otherwise whether its Available condition is true.
    pub fn add_managed_cluster(&self, name: &str, addon: Option<bool>) {
        let mut objects = self.objects.lock().unwrap();
        objects.clusters.push(ManagedCluster::new(
            name,
            ManagedClusterSpec {
                hub_accepts_client: true,
            },
        ));
        if let Some(available) = addon {
            let mut mca = ManagedClusterAddOn::new(ADDON_NAME, ManagedClusterAddOnSpec::default());
            mca.metadata.namespace = Some(name.to_string());
            mca.status = Some(ManagedClusterAddOnStatus {
                conditions: vec![Condition::new(
                    "Available",
                    if available { "True" } else { "False" },
                )],
            });
            objects.addons.insert(key(name, ADDON_NAME), mca);
        }
    }

    /// Adds a ManagedServiceAccount. With a token, its token secret (named after the account)
    /// is created and referenced from the status.
    pub fn add_service_account(&self, namespace: &str, name: &str, token: Option<&str>) {
        let mut msa = ManagedServiceAccount::new(name, ManagedServiceAccountSpec::default());
        msa.metadata.namespace = Some(namespace.to_string());
        if let Some(token) = token {
            msa.status = Some(ManagedServiceAccountStatus {
                conditions: vec![Condition::new("TokenReported", "True")],
                token_secret_ref: Some(SecretRef {
                    name: name.to_string(),
                }),
            });
            self.add_secret(
                namespace,
                name,
                Secret {
                    data: Some(BTreeMap::from([(
                        "token".to_string(),
                        ByteString(token.as_bytes().to_vec()),
                    )])),
                    ..Default::default()
                },
            );
        }
        self.objects
            .lock()
            .unwrap()
            .service_accounts
            .insert(key(namespace, name), msa);
    }

    /// Running proxy-server pods in `namespace`. Label selectors are not evaluated.
    pub fn set_pods(&self, namespace: &str, pods: &[&str]) {
        self.objects.lock().unwrap().pods.insert(
            namespace.to_string(),
            pods.iter().map(|p| p.to_string()).collect(),
        );
    }

    fn read<T>(&self, f: impl FnOnce(&Objects) -> T) -> Result<T, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        match &objects.failure {
            Some(message) => Err(Error::Config(message.clone())),
            None => Ok(f(&objects)),
        }
    }
}

#[async_trait::async_trait]
impl Hub for FakeHub {
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        self.read(|o| o.secrets.get(&key(namespace, name)).cloned())
    }

    async fn managed_clusters(&self) -> Result<Vec<ManagedCluster>, Error> {
        self.read(|o| o.clusters.clone())
    }

    async fn managed_cluster_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error> {
        self.read(|o| o.addons.get(&key(cluster, name)).cloned())
    }

    async fn cluster_management_addon(
        &self,
        name: &str,
    ) -> Result<Option<ClusterManagementAddOn>, Error> {
        self.read(|o| {
            o.cluster_management_addon
                .clone()
                .filter(|a| a.metadata.name.as_deref() == Some(name))
        })
    }

    async fn managed_proxy_configuration(
        &self,
        name: &str,
    ) -> Result<Option<ManagedProxyConfiguration>, Error> {
        self.read(|o| o.configurations.get(name).cloned())
    }

    async fn managed_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedServiceAccount>, Error> {
        self.read(|o| o.service_accounts.get(&key(namespace, name)).cloned())
    }

    async fn pods(&self, namespace: &str, _selector: &str) -> Result<Vec<String>, Error> {
        self.read(|o| o.pods.get(namespace).cloned().unwrap_or_default())
    }

    async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxedConn, Error> {
        let known = self
            .objects
            .lock()
            .unwrap()
            .pods
            .get(namespace)
            .is_some_and(|p| p.iter().any(|p| p == pod));
        if !known {
            return Err(Error::PortForward {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                reason: "pod not found".to_string(),
            });
        }
        let (client, mut server) = tokio::io::duplex(1024);
        let banner = format!("{pod}:{port}");
        tokio::spawn(async move {
            let _ = server.write_all(banner.as_bytes()).await;
            let _ = server.shutdown().await;
        });
        Ok(Box::new(client))
    }
}
