//! Where this worker sits in its party's local cluster.

use crate::error::{Result, TrainerError};

/// Addresses of every worker of one party, in rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    workers: Vec<String>,
}

impl ClusterSpec {
    pub fn new(workers: Vec<String>) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> &[String] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Resolved placement of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub local_address: String,
    pub worker_rank: usize,
    /// Rank 0 owns checkpoint writes.
    pub is_chief: bool,
}

/// Picks the address of `worker_rank` out of `cluster`.
pub fn resolve_placement(cluster: &ClusterSpec, worker_rank: usize) -> Result<Placement> {
    let local_address = cluster.workers.get(worker_rank).cloned().ok_or_else(|| {
        TrainerError::config(format!(
            "worker rank {worker_rank} is out of range for {} workers",
            cluster.len()
        ))
    })?;

    tracing::debug!(%local_address, worker_rank, "resolved worker placement");
    Ok(Placement {
        local_address,
        worker_rank,
        is_chief: worker_rank == 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterSpec {
        ClusterSpec::new(vec!["10.0.0.1:5000".into(), "10.0.0.2:5000".into()])
    }

    #[test]
    fn test_chief_is_rank_zero() {
        let placement = resolve_placement(&cluster(), 0).unwrap();
        assert_eq!(placement.local_address, "10.0.0.1:5000");
        assert!(placement.is_chief);

        let placement = resolve_placement(&cluster(), 1).unwrap();
        assert_eq!(placement.local_address, "10.0.0.2:5000");
        assert!(!placement.is_chief);
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = resolve_placement(&cluster(), 2).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(resolve_placement(&ClusterSpec::new(Vec::new()), 0).is_err());
    }
}
