// ABOUTME: Replication facade - one entry point per resource kind
// ABOUTME: Wires query building, cursor store, sink and pagination driver together

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::ReplicatorConfig;
use crate::credentials::{CredentialProvider, EnvCredentialProvider};
use crate::cursor::{CursorStore, FileCursorStore};
use crate::driver::{DriverConfig, PaginationDriver, RunStats, StopReason};
use crate::error::{ReplicationError, Result};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::lock::RunLock;
use crate::pacing::Pacer;
use crate::query::{ReplicationMode, ReplicationQuery};
use crate::resource::{ResourceKind, ResourceRegistry, ResourceSpec};
use crate::sink::{JsonFileSink, RecordSink};

/// Replicates MLS Grid resources for a single originating system.
///
/// Each call runs one pass for one kind:
/// 1. Take the kind's run lock
/// 2. Build the first request from the mode and stored cursor
/// 3. Hand it to a [`PaginationDriver`], which appends pages and advances the cursor
///
/// Failures come back as [`ReplicationError::RunFailed`] carrying the last cursor
/// that was persisted, which is where the next incremental pass resumes.
pub struct Replicator {
    config: ReplicatorConfig,
    registry: ResourceRegistry,
    fetcher: Arc<dyn Fetcher>,
    credentials: Arc<dyn CredentialProvider>,
    sink: Arc<dyn RecordSink>,
    cursors: Arc<dyn CursorStore>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        fetcher: Arc<dyn Fetcher>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn RecordSink>,
        cursors: Arc<dyn CursorStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = ResourceRegistry::new(&config.api_base_url)?;
        Ok(Self {
            config,
            registry,
            fetcher,
            credentials,
            sink,
            cursors,
            shutdown: None,
        })
    }

    /// Production wiring: HTTP fetcher, token from the environment, JSON files
    /// and cursor state under the configured state directory.
    pub fn from_config(config: ReplicatorConfig) -> Result<Self> {
        let state_dir = config.state_dir();
        let fetcher = HttpFetcher::new(config.request_timeout())?;
        let sink = JsonFileSink::new(&state_dir);
        let cursors = FileCursorStore::new(&state_dir, &config.system);
        Self::new(
            config,
            Arc::new(fetcher),
            Arc::new(EnvCredentialProvider),
            Arc::new(sink),
            Arc::new(cursors),
        )
    }

    /// Runs stop between pages once `shutdown` reads `true`, and later runs stop
    /// before their first request.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub async fn replicate_property(&self, mode: ReplicationMode) -> Result<RunStats> {
        self.replicate(ResourceKind::Property, mode).await
    }

    pub async fn replicate_member(&self, mode: ReplicationMode) -> Result<RunStats> {
        self.replicate(ResourceKind::Member, mode).await
    }

    pub async fn replicate_office(&self, mode: ReplicationMode) -> Result<RunStats> {
        self.replicate(ResourceKind::Office, mode).await
    }

    pub async fn replicate_openhouse(&self, mode: ReplicationMode) -> Result<RunStats> {
        self.replicate(ResourceKind::OpenHouse, mode).await
    }

    /// Run one replication pass for `resource`.
    pub async fn replicate(
        &self,
        resource: ResourceKind,
        mode: ReplicationMode,
    ) -> Result<RunStats> {
        let spec = self.registry.get(resource);

        let result = match RunLock::acquire(&self.config.state_dir(), &spec.lock_file, resource) {
            Ok(_lock) => self.run_pass(spec, mode).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(stats) => Ok(stats),
            Err(e) => {
                let last_cursor = self.cursors.load(resource).await.ok().flatten();
                tracing::error!("Replication of {} failed: {}", resource, e);
                Err(ReplicationError::RunFailed {
                    resource,
                    last_cursor,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Replicate every kind one after another, stopping at the first failure
    /// or cancelled pass.
    pub async fn replicate_all(&self, mode: ReplicationMode) -> Result<Vec<RunStats>> {
        let mut all = Vec::with_capacity(ResourceKind::ALL.len());
        for spec in self.registry.iter() {
            let stats = self.replicate(spec.kind, mode).await?;
            let cancelled = stats.stop_reason == StopReason::Cancelled;
            all.push(stats);
            if cancelled {
                tracing::info!("Shutdown requested, skipping remaining resources");
                break;
            }
        }
        Ok(all)
    }

    /// Replicate several kinds at once. Kinds share nothing but the pacing policy,
    /// and each gets its own pacer, so one kind's delays never hold up another.
    pub async fn replicate_concurrently(
        &self,
        resources: &[ResourceKind],
        mode: ReplicationMode,
    ) -> Result<Vec<RunStats>> {
        let unique: BTreeSet<ResourceKind> = resources.iter().copied().collect();
        futures::future::try_join_all(unique.into_iter().map(|kind| self.replicate(kind, mode)))
            .await
    }

    /// Stored cursor for every kind, in registry order.
    pub async fn cursors(&self) -> Result<Vec<(ResourceKind, Option<String>)>> {
        let mut out = Vec::new();
        for spec in self.registry.iter() {
            out.push((spec.kind, self.cursors.load(spec.kind).await?));
        }
        Ok(out)
    }

    /// Delete all cursors and replicated output for a fresh start.
    ///
    /// Test/reset use only; the next pass for every kind must be an initial one.
    pub async fn cleanup(&self) -> Result<()> {
        tracing::warn!(
            "Removing all cursors and replicated output under {:?}",
            self.config.state_dir()
        );
        self.cursors.clear().await?;
        self.sink.clear().await?;
        Ok(())
    }

    async fn run_pass(&self, spec: &ResourceSpec, mode: ReplicationMode) -> Result<RunStats> {
        let resource = spec.kind;
        tracing::debug!("{}: Building query ({:?})", resource, mode);

        let cursor = self.cursors.load(resource).await?;
        let url = ReplicationQuery {
            resource: spec,
            mode,
            system: &self.config.system,
            cursor: cursor.as_deref(),
            expand: &self.config.expand,
            top: self.config.effective_page_size(),
        }
        .build()?;

        match (mode, cursor.as_deref()) {
            (ReplicationMode::Incremental, Some(c)) => {
                tracing::info!("{}: incremental pass from cursor {}", resource, c)
            }
            (ReplicationMode::Initial, Some(c)) => tracing::warn!(
                "{}: initial pass with an existing cursor ({}); records will be appended again",
                resource,
                c
            ),
            _ => tracing::info!("{}: initial pass", resource),
        }

        let auth_header = self.credentials.authorization_header()?;

        let mut driver = PaginationDriver::new(
            self.fetcher.as_ref(),
            self.sink.as_ref(),
            self.cursors.as_ref(),
            Pacer::new(self.config.request_interval()),
            DriverConfig {
                max_attempts: self.config.max_attempts,
                max_iterations: self.config.effective_max_iterations(),
            },
        );
        if let Some(shutdown) = &self.shutdown {
            driver = driver.with_shutdown(shutdown.clone());
        }

        driver.run(resource, &url, &auth_header).await
    }
}
