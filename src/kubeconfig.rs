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

use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::TempPath;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("encoding kubeconfig: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("writing kubeconfig: {0}")]
    Write(#[from] std::io::Error),
}

/// KubeConfig is a `v1 Config` with one cluster, one user and one context pointing at the local
/// reverse proxy.
#[derive(Serialize, Clone, PartialEq, Eq)]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    insecure_skip_tls_verify: bool,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
struct User {
    token: String,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Serialize, Clone, PartialEq, Eq)]
struct Context {
    cluster: String,
    user: String,
}

impl fmt::Debug for KubeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConfig")
            .field("context", &self.current_context)
            .field(
                "server",
                &self.clusters.first().map(|c| c.cluster.server.as_str()),
            )
            .finish_non_exhaustive()
    }
}

/// synthesize builds the kubeconfig for `cluster` served on `localhost:<port>`. The listener
/// certificate is not issued for localhost, so verification is skipped.
pub fn synthesize(cluster: &str, port: u16, token: &str) -> KubeConfig {
    KubeConfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: cluster.to_string(),
            cluster: Cluster {
                server: format!("https://localhost:{port}"),
                insecure_skip_tls_verify: true,
            },
        }],
        users: vec![NamedUser {
            name: cluster.to_string(),
            user: User {
                token: token.to_string(),
            },
        }],
        contexts: vec![NamedContext {
            name: cluster.to_string(),
            context: Context {
                cluster: cluster.to_string(),
                user: cluster.to_string(),
            },
        }],
        current_context: cluster.to_string(),
    }
}

impl KubeConfig {
    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// TempKubeconfig is a kubeconfig file removed from disk when dropped.
pub struct TempKubeconfig {
    path: TempPath,
}

impl TempKubeconfig {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// write_temp writes `config` to `<tmp>/<cluster>-<uuid>.kubeconfig`, readable by the owner only.
pub fn write_temp(cluster: &str, config: &KubeConfig) -> Result<TempKubeconfig, Error> {
    let contents = config.to_yaml()?;
    let prefix = format!("{cluster}-{}", uuid::Uuid::new_v4());
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".kubeconfig").rand_bytes(0);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o600));
    }
    let mut file = builder.tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    let path = file.into_temp_path();
    debug!(path = %path.display(), "wrote kubeconfig");
    Ok(TempKubeconfig { path })
}
