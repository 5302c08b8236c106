//! Staged writes committed as one redb transaction.

use crate::types::*;

/// A single staged record mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutCluster(Cluster),
    DeleteCluster(ClusterId),
    PutDeployment(Deployment),
    DeleteDeployment(DeploymentId),
    PutQueueEntry(QueueEntry),
    DeleteQueueEntry(DeploymentId),
}

/// An ordered list of record mutations applied all-or-nothing.
///
/// Later operations on the same key win, matching the order in which the
/// scheduler staged them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_cluster(&mut self, cluster: &Cluster) -> &mut Self {
        self.ops.push(WriteOp::PutCluster(cluster.clone()));
        self
    }

    pub fn delete_cluster(&mut self, id: &str) -> &mut Self {
        self.ops.push(WriteOp::DeleteCluster(id.to_string()));
        self
    }

    pub fn put_deployment(&mut self, deployment: &Deployment) -> &mut Self {
        self.ops.push(WriteOp::PutDeployment(deployment.clone()));
        self
    }

    pub fn delete_deployment(&mut self, id: &str) -> &mut Self {
        self.ops.push(WriteOp::DeleteDeployment(id.to_string()));
        self
    }

    pub fn put_queue_entry(&mut self, entry: &QueueEntry) -> &mut Self {
        self.ops.push(WriteOp::PutQueueEntry(entry.clone()));
        self
    }

    pub fn delete_queue_entry(&mut self, deployment_id: &str) -> &mut Self {
        self.ops
            .push(WriteOp::DeleteQueueEntry(deployment_id.to_string()));
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
