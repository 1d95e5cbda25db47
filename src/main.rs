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

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use clusterproxy::config::{Cli, Command, HealthCommand, KubectlCommand};
use clusterproxy::*;
use tracing::{debug, info};

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!("{}", version::BuildInfo::new());
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::setup_logging();
    tls::install_default_provider();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(cli).await })
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    info!("version: {}", version::BuildInfo::new());
    let cancel = signal::cancel_on_shutdown();
    match &cli.command {
        Command::Health(args) => {
            let config = config::construct_config(&cli, &args.proxy)?;
            let cmd = HealthCommand::try_from(args)?;
            debug!("running with config: {}", serde_yaml::to_string(&config)?);
            let hub = app::connect_hub(&config).await?;
            app::health(&config, &cmd, hub, cancel, &mut std::io::stdout()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Kubectl(args) => {
            let config = config::construct_config(&cli, &args.proxy)?;
            let cmd = KubectlCommand::try_from(args)?;
            debug!("running with config: {}", serde_yaml::to_string(&config)?);
            let kubectl = app::find_kubectl()?;
            let hub = app::connect_hub(&config).await?;
            let status = app::kubectl(&config, &cmd, hub, &kubectl, cancel).await?;
            Ok(match status.code() {
                Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
                None => ExitCode::FAILURE,
            })
        }
        Command::Version => Ok(ExitCode::SUCCESS),
    }
}
