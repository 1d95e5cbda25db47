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

//! Read-only views of the open-cluster-management resources we consume. Only the fields this
//! crate reads are modelled; everything else is ignored on deserialization.

use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: &str) -> Self {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    #[serde(default)]
    pub hub_accepts_client: bool,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    plural = "managedclusteraddons",
    namespaced,
    status = "ManagedClusterAddOnStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterManagementAddOn",
    plural = "clustermanagementaddons",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManagementAddOnSpec {
    /// Legacy single configuration reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_on_configuration: Option<ConfigCoordinates>,
    #[serde(default)]
    pub supported_configs: Vec<ConfigMeta>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCoordinates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crd_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMeta {
    #[serde(default)]
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<ConfigReferent>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReferent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "proxy.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedProxyConfiguration",
    plural = "managedproxyconfigurations",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProxyConfigurationSpec {
    #[serde(default)]
    pub proxy_server: ProxyServerSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServerSpec {
    #[serde(default)]
    pub namespace: String,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "authentication.open-cluster-management.io",
    version = "v1beta1",
    kind = "ManagedServiceAccount",
    plural = "managedserviceaccounts",
    namespaced,
    status = "ManagedServiceAccountStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServiceAccountSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServiceAccountStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<SecretRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use kube::Resource;

    use super::*;

    #[test]
    fn addon_status_from_api_json() {
        let addon: ManagedClusterAddOn = serde_json::from_value(serde_json::json!({
            "apiVersion": "addon.open-cluster-management.io/v1alpha1",
            "kind": "ManagedClusterAddOn",
            "metadata": {"name": "cluster-proxy", "namespace": "cluster-a"},
            "spec": {"installNamespace": "open-cluster-management-agent-addon"},
            "status": {"conditions": [
                {"type": "Progressing", "status": "False", "reason": "Done"},
                {"type": "Available", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"}
            ]}
        }))
        .unwrap();
        let conditions = addon.status.unwrap().conditions;
        assert!(is_condition_true(&conditions, "Available"));
        assert!(!is_condition_true(&conditions, "Progressing"));
        assert!(!is_condition_true(&conditions, "Degraded"));
    }

    #[test]
    fn cluster_management_addon_configs() {
        let cma: ClusterManagementAddOn = serde_json::from_value(serde_json::json!({
            "apiVersion": "addon.open-cluster-management.io/v1alpha1",
            "kind": "ClusterManagementAddOn",
            "metadata": {"name": "cluster-proxy"},
            "spec": {
                "addOnConfiguration": {"crdName": "managedproxyconfigurations.proxy.open-cluster-management.io", "crName": "legacy"},
                "supportedConfigs": [{
                    "group": "proxy.open-cluster-management.io",
                    "resource": "managedproxyconfigurations",
                    "defaultConfig": {"name": "cluster-proxy"}
                }]
            }
        }))
        .unwrap();
        assert_eq!(
            cma.spec.add_on_configuration.unwrap().cr_name.as_deref(),
            Some("legacy")
        );
        assert_eq!(
            cma.spec.supported_configs[0]
                .default_config
                .as_ref()
                .map(|c| c.name.as_str()),
            Some("cluster-proxy")
        );
    }

    #[test]
    fn resource_coordinates() {
        assert_eq!(
            ManagedServiceAccount::api_version(&()),
            "authentication.open-cluster-management.io/v1beta1"
        );
        assert_eq!(ManagedCluster::plural(&()), "managedclusters");
        assert_eq!(
            ManagedProxyConfiguration::group(&()),
            "proxy.open-cluster-management.io"
        );
    }
}
