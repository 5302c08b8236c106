//! One-shot admin commands against the local store.
//!
//! Each command returns its result as JSON for the caller to print.

use anyhow::bail;
use serde_json::{Value, json, to_value};

use fleetq_scheduler::{ClusterSpec, DeploymentRequest, Scheduler};
use fleetq_state::{ClusterStatus, Resources};

use crate::{ClusterAction, Command};

pub async fn execute(scheduler: &Scheduler, command: Command) -> anyhow::Result<Value> {
    let value = match command {
        Command::Run { .. } => bail!("`run` is not an admin command"),
        Command::Cluster { action } => cluster(scheduler, action).await?,
        Command::Submit {
            name,
            image,
            cluster,
            ram_gb,
            cpu_cores,
            gpu_count,
            priority,
            env,
        } => {
            let id = scheduler
                .submit(DeploymentRequest {
                    name,
                    image,
                    cluster_id: cluster,
                    ram_gb,
                    cpu_cores,
                    gpu_count,
                    priority,
                    environment: env.into_iter().collect(),
                })
                .await?;
            let position = scheduler.queue_position(&id).await?;
            to_value(position)?
        }
        Command::Cancel { id } => to_value(scheduler.cancel(&id).await?)?,
        Command::Finish { id, failed } => to_value(scheduler.finish(&id, !failed).await?)?,
        Command::Delete { id } => {
            scheduler.delete(&id).await?;
            json!({ "deleted": id })
        }
        Command::Show { id: Some(id) } => to_value(scheduler.deployment(&id).await?)?,
        Command::Show { id: None } => to_value(scheduler.list_deployments().await)?,
        Command::Schedule { id: Some(id) } => to_value(scheduler.schedule_one(&id).await?)?,
        Command::Schedule { id: None } => to_value(scheduler.run_scheduling_pass().await)?,
        Command::Priority { id, priority } => {
            to_value(scheduler.notify_priority_change(&id, priority).await?)?
        }
        Command::Queue { id: Some(id) } => to_value(scheduler.queue_position(&id).await?)?,
        Command::Queue { id: None } => to_value(scheduler.queue_status().await)?,
        Command::Reconcile => to_value(scheduler.reconcile().await?)?,
    };
    Ok(value)
}

async fn cluster(scheduler: &Scheduler, action: ClusterAction) -> anyhow::Result<Value> {
    let value = match action {
        ClusterAction::Add {
            id,
            name,
            ram_gb,
            cpu_cores,
            gpu_count,
        } => {
            let spec = ClusterSpec {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                ram_gb,
                cpu_cores,
                gpu_count,
            };
            to_value(scheduler.add_cluster(spec).await?)?
        }
        ClusterAction::List => to_value(scheduler.list_clusters().await)?,
        ClusterAction::Status { id } => to_value(scheduler.cluster_utilization(&id).await?)?,
        ClusterAction::SetStatus { id, status } => {
            let status: ClusterStatus = status.parse().map_err(anyhow::Error::msg)?;
            to_value(scheduler.set_cluster_status(&id, status).await?)?
        }
        ClusterAction::Resize {
            id,
            ram_gb,
            cpu_cores,
            gpu_count,
        } => {
            let total = Resources::from_units(ram_gb, cpu_cores, gpu_count);
            to_value(scheduler.resize_cluster(&id, total).await?)?
        }
        ClusterAction::Remove { id } => {
            scheduler.remove_cluster(&id).await?;
            json!({ "removed": id })
        }
    };
    Ok(value)
}

/// Parse a `KEY=VALUE` pair. The value may itself contain `=`.
pub fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}
