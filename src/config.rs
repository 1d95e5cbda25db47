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

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::tunnel::ProxyEndpoint;

const DIAL_TIMEOUT: &str = "CLUSTER_PROXY_DIAL_TIMEOUT";
const PROBE_TIMEOUT: &str = "CLUSTER_PROXY_PROBE_TIMEOUT";
const IDLE_TIMEOUT: &str = "CLUSTER_PROXY_IDLE_TIMEOUT";
const DRAIN_TIMEOUT: &str = "CLUSTER_PROXY_DRAIN_TIMEOUT";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_PROXY_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_PROXY_SERVER_PORT: u16 = 8090;

#[derive(Parser, Debug)]
#[command(
    name = "clusterproxy",
    version,
    about = "Reach managed cluster API servers through the cluster-proxy add-on",
    after_help = "More info at: https://open-cluster-management.io/getting-started/integration/cluster-proxy/"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true, value_name = "PATH")]
    /// Kubeconfig of the hub cluster, defaults to $KUBECONFIG or ~/.kube/config
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, global = true, value_name = "CONTEXT")]
    /// Kubeconfig context to use, defaults to the current context
    pub context: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe the API server of every managed cluster through the tunnel
    Health(HealthArgs),
    /// Run kubectl against a managed cluster through the tunnel
    Kubectl(KubectlArgs),
    /// Print build information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_name = "BOOL"
    )]
    /// Read the proxy certificates from the add-on secrets on the hub
    pub in_cluster_proxy_cert_lookup: bool,

    #[arg(long, value_name = "PATH")]
    /// CA certificate of the proxy server
    pub proxy_ca_cert: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    /// Client certificate presented to the proxy server
    pub proxy_cert: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    /// Private key of the client certificate
    pub proxy_key: Option<PathBuf>,

    #[arg(
        long,
        env = "CLUSTER_PROXY_SERVER_HOST",
        default_value = DEFAULT_PROXY_SERVER_HOST,
        value_name = "HOST"
    )]
    /// Proxy server host. The default loopback port-forwards to a proxy-server pod
    pub proxy_server_host: String,

    #[arg(
        long,
        env = "CLUSTER_PROXY_SERVER_PORT",
        default_value_t = DEFAULT_PROXY_SERVER_PORT,
        value_name = "PORT"
    )]
    /// Proxy server port
    pub proxy_server_port: u16,

    #[arg(long, value_name = "NAME")]
    /// Name verified on the proxy server certificate, defaults to the host
    pub proxy_server_name: Option<String>,

    #[arg(long)]
    /// Skip verification of the proxy server certificate
    pub proxy_server_insecure_skip_verify: bool,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    #[command(flatten)]
    pub proxy: ProxyArgs,

    #[arg(
        long = "cluster",
        visible_alias = "clusters",
        value_delimiter = ',',
        value_name = "NAME"
    )]
    /// Managed clusters to probe, all managed clusters when omitted
    pub clusters: Vec<String>,

    #[arg(long, default_value_t = 1, value_name = "N")]
    /// Number of clusters probed at once
    pub concurrency: usize,
}

#[derive(Args, Debug)]
pub struct KubectlArgs {
    #[command(flatten)]
    pub proxy: ProxyArgs,

    #[arg(long, value_name = "NAME")]
    /// Managed cluster to run kubectl against
    pub cluster: Option<String>,

    #[arg(long, value_name = "NAME")]
    /// ManagedServiceAccount whose token authenticates kubectl
    pub sa: Option<String>,

    #[arg(long, default_value = "", allow_hyphen_values = true, value_name = "ARGS")]
    /// Arguments passed to kubectl, e.g. "get pods -A"
    pub args: String,

    #[arg(long, default_value_t = 0, value_name = "PORT")]
    /// Local port of the reverse proxy, 0 picks a free port
    pub port: u16,
}

/// CertFiles are local paths to the proxy client credentials.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CertFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,

    /// Local credentials. When set, no secrets are read from the hub.
    pub cert_files: Option<CertFiles>,
    pub in_cluster_cert_lookup: bool,

    pub proxy_server: ProxyEndpoint,
    /// True when the proxy server is reached through a local port-forward to a pod.
    pub port_forward: bool,

    pub dial_timeout: Duration,
    pub probe_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCommand {
    pub clusters: Vec<String>,
    pub concurrency: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubectlCommand {
    pub cluster: String,
    pub service_account: String,
    pub args: Vec<String>,
    pub port: u16,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("--proxy-ca-cert, --proxy-cert and --proxy-key must be set together")]
    PartialCertFiles,
    #[error("no proxy certificates: pass --proxy-ca-cert, --proxy-cert and --proxy-key or enable --in-cluster-proxy-cert-lookup")]
    NoCertSource,
    #[error("--{0} is required")]
    MissingFlag(&'static str),
    #[error("invalid --args: {0}")]
    KubectlArgs(#[from] shell_words::ParseError),
    #[error("--concurrency must be at least 1")]
    Concurrency,
}

/// HumanDuration parses durations such as `10s`, `1m30s` or `500ms`.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str, default: Duration) -> Result<Duration, Error> {
    parse_default(env, HumanDuration(default)).map(|d| d.0)
}

pub fn construct_config(cli: &Cli, proxy: &ProxyArgs) -> Result<Config, Error> {
    let cert_files = match (
        empty_to_none(proxy.proxy_ca_cert.clone()),
        empty_to_none(proxy.proxy_cert.clone()),
        empty_to_none(proxy.proxy_key.clone()),
    ) {
        (Some(ca), Some(cert), Some(key)) => Some(CertFiles { ca, cert, key }),
        (None, None, None) => None,
        _ => return Err(Error::PartialCertFiles),
    };
    if cert_files.is_none() && !proxy.in_cluster_proxy_cert_lookup {
        return Err(Error::NoCertSource);
    }

    let server_name = proxy
        .proxy_server_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| proxy.proxy_server_host.clone());

    Ok(Config {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),

        cert_files,
        in_cluster_cert_lookup: proxy.in_cluster_proxy_cert_lookup,

        port_forward: proxy.proxy_server_host == DEFAULT_PROXY_SERVER_HOST
            && proxy.proxy_server_port == DEFAULT_PROXY_SERVER_PORT,
        proxy_server: ProxyEndpoint {
            host: proxy.proxy_server_host.clone(),
            port: proxy.proxy_server_port,
            server_name,
            insecure_skip_verify: proxy.proxy_server_insecure_skip_verify,
        },

        dial_timeout: parse_duration(DIAL_TIMEOUT, DEFAULT_DIAL_TIMEOUT)?,
        probe_timeout: parse_duration(PROBE_TIMEOUT, DEFAULT_PROBE_TIMEOUT)?,
        idle_timeout: parse_duration(IDLE_TIMEOUT, DEFAULT_IDLE_TIMEOUT)?,
        drain_timeout: parse_duration(DRAIN_TIMEOUT, DEFAULT_DRAIN_TIMEOUT)?,
    })
}

impl TryFrom<&HealthArgs> for HealthCommand {
    type Error = Error;

    fn try_from(args: &HealthArgs) -> Result<Self, Self::Error> {
        if args.concurrency == 0 {
            return Err(Error::Concurrency);
        }
        Ok(HealthCommand {
            clusters: args
                .clusters
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            concurrency: args.concurrency,
        })
    }
}

impl TryFrom<&KubectlArgs> for KubectlCommand {
    type Error = Error;

    fn try_from(args: &KubectlArgs) -> Result<Self, Self::Error> {
        let cluster = empty_to_none(args.cluster.clone()).ok_or(Error::MissingFlag("cluster"))?;
        let service_account = empty_to_none(args.sa.clone()).ok_or(Error::MissingFlag("sa"))?;
        Ok(KubectlCommand {
            cluster,
            service_account,
            args: shell_words::split(&args.args)?,
            port: args.port,
        })
    }
}

pub fn empty_to_none<A: AsRef<std::ffi::OsStr>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("clusterproxy").chain(args.iter().copied())).unwrap()
    }

    fn health(args: &[&str]) -> (Cli, HealthArgs) {
        let mut c = cli(args);
        let Command::Health(h) = std::mem::replace(&mut c.command, Command::Version) else {
            panic!("expected health");
        };
        (c, h)
    }

    fn kubectl(args: &[&str]) -> KubectlArgs {
        match cli(args).command {
            Command::Kubectl(k) => k,
            other => panic!("expected kubectl, got {other:?}"),
        }
    }

    #[test]
    fn health_defaults() {
        let (c, h) = health(&["health"]);
        let cfg = construct_config(&c, &h.proxy).unwrap();
        assert_eq!(cfg.cert_files, None);
        assert!(cfg.in_cluster_cert_lookup);
        assert!(cfg.port_forward);
        assert_eq!(cfg.proxy_server.host, "127.0.0.1");
        assert_eq!(cfg.proxy_server.port, 8090);
        assert_eq!(cfg.proxy_server.server_name, "127.0.0.1");
        assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(90));

        let cmd = HealthCommand::try_from(&h).unwrap();
        assert!(cmd.clusters.is_empty());
        assert_eq!(cmd.concurrency, 1);
    }

    #[test]
    fn cluster_lists() {
        let (_, h) = health(&["health", "--clusters", "cluster-a,cluster-b"]);
        assert_eq!(
            HealthCommand::try_from(&h).unwrap().clusters,
            vec!["cluster-a", "cluster-b"]
        );
        let (_, h) = health(&["health", "--cluster", "c1", "--cluster", "c2"]);
        assert_eq!(HealthCommand::try_from(&h).unwrap().clusters, vec!["c1", "c2"]);
        let (_, h) = health(&["health", "--concurrency", "0"]);
        assert!(matches!(
            HealthCommand::try_from(&h),
            Err(Error::Concurrency)
        ));
    }

    #[test]
    fn cert_files_all_or_nothing() {
        let (c, h) = health(&[
            "health",
            "--proxy-ca-cert",
            "ca.crt",
            "--proxy-cert",
            "tls.crt",
            "--proxy-key",
            "tls.key",
        ]);
        let cfg = construct_config(&c, &h.proxy).unwrap();
        assert_eq!(
            cfg.cert_files,
            Some(CertFiles {
                ca: "ca.crt".into(),
                cert: "tls.crt".into(),
                key: "tls.key".into(),
            })
        );

        let (c, h) = health(&["health", "--proxy-ca-cert", "ca.crt"]);
        assert!(matches!(
            construct_config(&c, &h.proxy),
            Err(Error::PartialCertFiles)
        ));

        let (c, h) = health(&["health", "--in-cluster-proxy-cert-lookup", "false"]);
        assert!(matches!(
            construct_config(&c, &h.proxy),
            Err(Error::NoCertSource)
        ));
    }

    #[test]
    fn explicit_proxy_server() {
        let (c, h) = health(&[
            "health",
            "--proxy-server-host",
            "proxy.example.com",
            "--proxy-server-port",
            "443",
        ]);
        let cfg = construct_config(&c, &h.proxy).unwrap();
        assert!(!cfg.port_forward);
        assert_eq!(cfg.proxy_server.server_name, "proxy.example.com");
        assert_eq!(cfg.proxy_server.port, 443);

        // A forward the user runs on another local port is used as is.
        let (c, h) = health(&["health", "--proxy-server-port", "9999"]);
        let cfg = construct_config(&c, &h.proxy).unwrap();
        assert!(!cfg.port_forward);
        assert_eq!(cfg.proxy_server.host, "127.0.0.1");
        assert_eq!(cfg.proxy_server.port, 9999);
    }

    #[test]
    fn kubectl_flags() {
        let cmd = KubectlCommand::try_from(&kubectl(&[
            "kubectl",
            "--cluster",
            "c1",
            "--sa",
            "admin",
            "--args",
            "get pods -n 'kube system'",
        ]))
        .unwrap();
        assert_eq!(cmd.cluster, "c1");
        assert_eq!(cmd.service_account, "admin");
        assert_eq!(cmd.args, vec!["get", "pods", "-n", "kube system"]);

        assert!(matches!(
            KubectlCommand::try_from(&kubectl(&["kubectl", "--sa", "admin"])),
            Err(Error::MissingFlag("cluster"))
        ));
        assert!(matches!(
            KubectlCommand::try_from(&kubectl(&["kubectl", "--cluster", "c1"])),
            Err(Error::MissingFlag("sa"))
        ));
        assert!(matches!(
            KubectlCommand::try_from(&kubectl(&[
                "kubectl", "--cluster", "c1", "--sa", "a", "--args", "'unterminated"
            ])),
            Err(Error::KubectlArgs(_))
        ));
    }

    #[test]
    fn human_durations() {
        assert_eq!(
            "1m30s".parse::<HumanDuration>().unwrap().0,
            Duration::from_secs(90)
        );
        assert_eq!(
            "250ms".parse::<HumanDuration>().unwrap().0,
            Duration::from_millis(250)
        );
        assert!("soon".parse::<HumanDuration>().is_err());
    }
}
