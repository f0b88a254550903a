//! Reconciliation: converge the registry to a caller-supplied desired set.
//!
//! Unlike the teacher's control-plane-driven loop, the desired set is
//! supplied by the embedding caller (`spec.md` §4.R: "the runtime does not
//! fetch its own desired state"). The reconciler's job is purely the diff
//! + converge + orphan sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::runtime::Runtime;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub reconcile_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// Source of the desired instance set this node should converge to.
#[async_trait::async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn desired_instance_ids(&self) -> HashSet<String>;
}

/// Converges the registry to a desired set, deleting surplus instances.
pub struct Reconciler {
    runtime: Arc<Runtime>,
    desired_source: Arc<dyn DesiredStateSource>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<Runtime>,
        desired_source: Arc<dyn DesiredStateSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            runtime,
            desired_source,
            config,
        }
    }

    /// Run until `shutdown` signals true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "reconciliation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Diff the registry against the desired set and delete surplus
    /// instances. Returns the instance ids that were deleted.
    pub async fn reconcile_once(&self) -> Result<Vec<String>, crate::error::RuntimeError> {
        debug!("starting reconciliation pass");

        let desired = self.desired_source.desired_instance_ids().await;
        let live = self.runtime.list_instance_ids().await;

        let surplus: Vec<String> = live.difference(&desired).cloned().collect();
        let mut deleted = Vec::with_capacity(surplus.len());

        for instance_id in surplus {
            info!(instance_id = %instance_id, "deleting surplus instance");
            match self.runtime.delete(&instance_id).await {
                Ok(()) => deleted.push(instance_id),
                Err(e) => warn!(instance_id = %instance_id, error = %e, "failed to delete surplus instance"),
            }
        }

        Ok(deleted)
    }

    /// Sweep host-level TAP devices that don't correspond to any live
    /// instance (`spec.md` §4.R "startup orphan sweep").
    pub async fn sweep_orphan_taps(&self) -> Vec<String> {
        let live_ids = self.runtime.list_instance_ids().await;
        let live_taps: HashSet<String> = live_ids
            .iter()
            .map(|id| crate::allocator::tap_name(id))
            .collect();
        crate::network::sweep_orphan_taps(&live_taps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDesired(HashSet<String>);

    #[async_trait::async_trait]
    impl DesiredStateSource for FixedDesired {
        async fn desired_instance_ids(&self) -> HashSet<String> {
            self.0.clone()
        }
    }

    #[test]
    fn default_interval_is_five_seconds() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn empty_desired_set_is_a_valid_source() {
        let source = FixedDesired(HashSet::new());
        assert!(source.desired_instance_ids().await.is_empty());
    }
}
