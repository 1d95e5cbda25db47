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

//! Locates the cluster-proxy add-on installation on the hub.

use tracing::debug;

use crate::hub::{self, ClusterManagementAddOn, Hub};

pub const ADDON_NAME: &str = "cluster-proxy";
const DEFAULT_CONFIGURATION_NAME: &str = "cluster-proxy";
const DEFAULT_PROXY_NAMESPACE: &str = "open-cluster-management-cluster-proxy";

const PROXY_CONFIG_GROUP: &str = "proxy.open-cluster-management.io";
const PROXY_CONFIG_RESOURCE: &str = "managedproxyconfigurations";

const INSTALL_GUIDE: &str =
    "https://open-cluster-management.io/getting-started/integration/cluster-proxy/";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cluster-Proxy addon is not installed on the hub. See {INSTALL_GUIDE} to install it")]
    AddonNotInstalled,
    #[error(
        "ManagedProxyConfiguration {0:?} not found. The Cluster-Proxy addon looks incomplete, see {INSTALL_GUIDE}"
    )]
    ConfigurationNotFound(String),
    #[error("ManagedServiceAccount {namespace}/{name} not found")]
    ServiceAccountNotFound { namespace: String, name: String },
    #[error("ManagedServiceAccount {namespace}/{name} has no token secret yet")]
    TokenNotReady { namespace: String, name: String },
    #[error("token secret {namespace}/{name} not found or has no token")]
    TokenSecret { namespace: String, name: String },
    #[error(transparent)]
    Hub(#[from] hub::Error),
}

/// Installation describes where the add-on's proxy server runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Installation {
    pub configuration: String,
    pub namespace: String,
}

pub async fn installation(hub: &dyn Hub) -> Result<Installation, Error> {
    let addon = hub
        .cluster_management_addon(ADDON_NAME)
        .await?
        .ok_or(Error::AddonNotInstalled)?;
    let configuration = configuration_name(&addon);
    let config = hub
        .managed_proxy_configuration(&configuration)
        .await?
        .ok_or_else(|| Error::ConfigurationNotFound(configuration.clone()))?;
    let namespace = if config.spec.proxy_server.namespace.is_empty() {
        DEFAULT_PROXY_NAMESPACE.to_string()
    } else {
        config.spec.proxy_server.namespace
    };
    debug!(%configuration, %namespace, "found cluster-proxy installation");
    Ok(Installation {
        configuration,
        namespace,
    })
}

/// The legacy `addOnConfiguration.crName` wins; otherwise the default config registered for
/// ManagedProxyConfigurations.
fn configuration_name(addon: &ClusterManagementAddOn) -> String {
    if let Some(name) = addon
        .spec
        .add_on_configuration
        .as_ref()
        .and_then(|c| c.cr_name.as_deref())
        .filter(|n| !n.is_empty())
    {
        return name.to_string();
    }
    addon
        .spec
        .supported_configs
        .iter()
        .filter(|c| c.group == PROXY_CONFIG_GROUP && c.resource == PROXY_CONFIG_RESOURCE)
        .find_map(|c| c.default_config.as_ref().map(|d| d.name.clone()))
        .unwrap_or_else(|| DEFAULT_CONFIGURATION_NAME.to_string())
}

/// Reads the bearer token issued for the ManagedServiceAccount `name` in the cluster namespace.
pub async fn service_account_token(
    hub: &dyn Hub,
    cluster: &str,
    name: &str,
) -> Result<String, Error> {
    let msa = hub
        .managed_service_account(cluster, name)
        .await?
        .ok_or_else(|| Error::ServiceAccountNotFound {
            namespace: cluster.to_string(),
            name: name.to_string(),
        })?;
    let secret_name = msa
        .status
        .and_then(|s| s.token_secret_ref)
        .map(|r| r.name)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::TokenNotReady {
            namespace: cluster.to_string(),
            name: name.to_string(),
        })?;
    let missing = || Error::TokenSecret {
        namespace: cluster.to_string(),
        name: secret_name.clone(),
    };
    let secret = hub.secret(cluster, &secret_name).await?.ok_or_else(missing)?;
    secret
        .data
        .and_then(|mut d| d.remove("token"))
        .and_then(|t| String::from_utf8(t.0).ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{
        ClusterManagementAddOnSpec, ConfigCoordinates, ConfigMeta, ConfigReferent,
    };
    use crate::test_helpers::hub::FakeHub;

    fn addon(spec: ClusterManagementAddOnSpec) -> ClusterManagementAddOn {
        ClusterManagementAddOn::new(ADDON_NAME, spec)
    }

    #[tokio::test]
    async fn not_installed_has_hint() {
        let hub = FakeHub::default();
        let err = installation(&hub).await.unwrap_err();
        assert!(matches!(err, Error::AddonNotInstalled));
        assert!(err.to_string().contains("open-cluster-management.io"));
    }

    #[tokio::test]
    async fn default_installation() {
        let hub = FakeHub::default();
        hub.install_addon("open-cluster-management-addon");
        assert_eq!(
            installation(&hub).await.unwrap(),
            Installation {
                configuration: "cluster-proxy".to_string(),
                namespace: "open-cluster-management-addon".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn missing_configuration() {
        let hub = FakeHub::default();
        hub.set_cluster_management_addon(addon(ClusterManagementAddOnSpec::default()));
        assert!(matches!(
            installation(&hub).await,
            Err(Error::ConfigurationNotFound(name)) if name == "cluster-proxy"
        ));
    }

    #[test]
    fn configuration_name_precedence() {
        let supported = vec![
            ConfigMeta {
                group: "addon.open-cluster-management.io".to_string(),
                resource: "addondeploymentconfigs".to_string(),
                default_config: Some(ConfigReferent {
                    namespace: None,
                    name: "deploy".to_string(),
                }),
            },
            ConfigMeta {
                group: PROXY_CONFIG_GROUP.to_string(),
                resource: PROXY_CONFIG_RESOURCE.to_string(),
                default_config: Some(ConfigReferent {
                    namespace: None,
                    name: "from-default".to_string(),
                }),
            },
        ];
        assert_eq!(
            configuration_name(&addon(ClusterManagementAddOnSpec {
                add_on_configuration: Some(ConfigCoordinates {
                    cr_name: Some("legacy".to_string()),
                    crd_name: None,
                }),
                supported_configs: supported.clone(),
            })),
            "legacy"
        );
        assert_eq!(
            configuration_name(&addon(ClusterManagementAddOnSpec {
                add_on_configuration: None,
                supported_configs: supported,
            })),
            "from-default"
        );
        assert_eq!(
            configuration_name(&addon(ClusterManagementAddOnSpec::default())),
            "cluster-proxy"
        );
    }

    #[tokio::test]
    async fn token_lookup() {
        let hub = FakeHub::default();
        assert!(matches!(
            service_account_token(&hub, "c1", "admin").await,
            Err(Error::ServiceAccountNotFound { .. })
        ));
        hub.add_service_account("c1", "admin", None);
        assert!(matches!(
            service_account_token(&hub, "c1", "admin").await,
            Err(Error::TokenNotReady { .. })
        ));
        hub.add_service_account("c1", "admin", Some("T"));
        assert_eq!(
            service_account_token(&hub, "c1", "admin").await.unwrap(),
            "T"
        );
    }
}
