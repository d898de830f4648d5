//! strongbox operator - declarative database backups for Kubernetes

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use strongbox_backup::{Context, OperatorConfig};
use strongbox_common::telemetry::{init_telemetry, TelemetryConfig};
use strongbox_operator::config::Cli;
use strongbox_operator::{controller_runner, crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crds::render_all()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "strongbox-operator".to_string(),
        json: !cli.log_text,
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("skipping CRD installation");
    } else {
        crds::ensure_crds_installed(&client).await?;
    }

    let config: OperatorConfig = cli.operator.into();
    tracing::info!(?config, "starting strongbox controllers");
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    futures::future::join_all(controller_runner::build_controllers(client, ctx)).await;

    tracing::info!("controllers stopped, shutting down");
    Ok(())
}
