use crate::cluster::ClusterApi;
use crate::config::Settings;
use crate::controller::backup::BackupStore;
use crate::controller::clock::Clock;
use crate::controller::confirm::Confirmer;
use crate::controller::wait::WaitPolicy;
use std::sync::Arc;

/// Everything an orchestrator needs, threaded explicitly through each run
pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub clock: Arc<dyn Clock>,
    pub confirmer: Arc<dyn Confirmer>,
    pub backups: BackupStore,
    pub settings: Settings,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        clock: Arc<dyn Clock>,
        confirmer: Arc<dyn Confirmer>,
        settings: Settings,
    ) -> Self {
        Context {
            cluster,
            clock,
            confirmer,
            backups: BackupStore::new(settings.backup_dir.clone()),
            settings,
        }
    }

    /// Policy for deployment rollout convergence
    pub fn rollout_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.settings.rollout_timeout,
            self.settings.rollout_poll_interval,
        )
    }

    /// Policy for pod readiness of a copied deployment
    pub fn pods_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.settings.pods_timeout,
            self.settings.pods_poll_interval,
        )
    }

    /// Policy for a deleted deployment to disappear
    pub fn deletion_policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            self.settings.deletion_timeout,
            self.settings.deletion_poll_interval,
        )
    }

    /// Create a Context wired to in-memory test doubles
    ///
    /// Returns the concrete fake and clock alongside, for seeding and assertions.
    #[cfg(test)]
    pub fn new_mock(
        backup_dir: &std::path::Path,
        confirmer: crate::controller::confirm::ScriptedConfirmer,
    ) -> MockContext {
        use crate::cluster::fake::FakeCluster;
        use crate::controller::clock::MockClock;
        use chrono::TimeZone;

        #[allow(clippy::unwrap_used)]
        let start = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        let clock = Arc::new(MockClock::new(start));
        let cluster = Arc::new(FakeCluster::with_clock(clock.clone()));
        let confirmer = Arc::new(confirmer);

        let ctx = Context::new(
            cluster.clone(),
            clock.clone(),
            confirmer.clone(),
            Settings::with_backup_dir(backup_dir),
        );

        MockContext {
            ctx,
            cluster,
            clock,
            confirmer,
        }
    }
}

/// A test [`Context`] plus typed handles to its doubles
#[cfg(test)]
pub struct MockContext {
    pub ctx: Context,
    pub cluster: Arc<crate::cluster::fake::FakeCluster>,
    pub clock: Arc<crate::controller::clock::MockClock>,
    pub confirmer: Arc<crate::controller::confirm::ScriptedConfirmer>,
}
