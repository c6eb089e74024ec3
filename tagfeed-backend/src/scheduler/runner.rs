use crate::config::{defaults, Config};
use crate::context::SiteContext;
use crate::db::query::AggregateQuery;
use crate::error::Result;
use crate::ingest::IngestReport;
use crate::tagbox::{RunContext, RunOutcome};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{interval, Duration as TokioDuration};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Seconds between cycles
    pub poll_interval_secs: u64,
    /// Most (tagbox, affected) pairs rerun per cycle
    pub run_limit: usize,
    /// Weighted importance a pair needs before it is rerun
    pub min_weighted_sum: f64,
    /// Events read per kind per ingestion pass
    pub ingest_batch: usize,
    pub ingest_passes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            run_limit: defaults::RUN_LIMIT,
            min_weighted_sum: defaults::MIN_WEIGHTED_SUM,
            ingest_batch: defaults::INGEST_BATCH,
            ingest_passes: defaults::INGEST_PASSES_PER_TICK,
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        SchedulerConfig {
            poll_interval_secs: config.poll_interval_secs,
            run_limit: config.run_limit,
            min_weighted_sum: config.min_weighted_sum,
            ingest_batch: config.ingest_batch,
            ..Default::default()
        }
    }
}

/// One successful recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRun {
    pub tagbox_id: i64,
    pub affected_id: i64,
    pub outcome: RunOutcome,
    /// Feeder log entries compacted after the run
    pub entries_compacted: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub ingest: IngestReport,
    pub completed: Vec<CompletedRun>,
    /// Pairs whose run failed; their log entries are kept
    pub failed: Vec<(i64, i64)>,
}

/// Ingest, rank, rerun and compact once.
///
/// Each pair is compacted only up to the `max_entry_id` captured by the
/// aggregate snapshot, so entries appended while the run was in progress
/// survive into the next cycle.
pub fn run_cycle(ctx: &SiteContext, config: &SchedulerConfig) -> Result<CycleReport> {
    let mut report = CycleReport {
        ingest: ctx
            .ingestor(config.ingest_batch)
            .run_until_idle(config.ingest_passes)?,
        ..Default::default()
    };

    let registry = ctx.registry();
    let query = AggregateQuery::new(config.run_limit, config.min_weighted_sum)
        .excluding(registry.unavailable_ids()?);
    let top = ctx.db().top_affected(&query)?;

    let run_ctx = RunContext {
        history: ctx.history(),
        now: Utc::now(),
    };
    for aggregate in top {
        let (tagbox_id, affected_id) = (aggregate.tagbox_id, aggregate.affected_id);
        if registry.is_disabled(tagbox_id) {
            continue;
        }
        let Some(tagbox) = registry.get(tagbox_id)? else {
            continue;
        };

        match tagbox.run(&run_ctx, affected_id) {
            Ok(outcome) => {
                let entries_compacted =
                    ctx.db()
                        .mark_run_complete(tagbox_id, affected_id, aggregate.max_entry_id)?;
                log::info!(
                    "[SCHEDULER] {} reran {}: score {} (weighted sum {}, {} entries compacted)",
                    tagbox.name(),
                    affected_id,
                    outcome.score,
                    aggregate.sum_weighted_importance,
                    entries_compacted
                );
                report.completed.push(CompletedRun {
                    tagbox_id,
                    affected_id,
                    outcome,
                    entries_compacted,
                });
            }
            Err(e) if e.is_config() => {
                registry.disable(tagbox_id, &e);
                report.failed.push((tagbox_id, affected_id));
            }
            Err(e) => {
                log::error!(
                    "[SCHEDULER] {} failed to rerun {}: {}",
                    tagbox.name(),
                    affected_id,
                    e
                );
                report.failed.push((tagbox_id, affected_id));
            }
        }
    }

    Ok(report)
}

/// Drives [`run_cycle`] on a fixed interval until shut down.
pub struct Scheduler {
    ctx: Arc<SiteContext>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(ctx: Arc<SiteContext>, config: SchedulerConfig) -> Self {
        Scheduler { ctx, config }
    }

    /// Start the scheduler loop
    pub async fn start(self: Arc<Self>, mut shutdown_rx: oneshot::Receiver<()>) {
        log::info!(
            "[SCHEDULER] Started (poll: {}s, run limit: {}, min weighted sum: {})",
            self.config.poll_interval_secs,
            self.config.run_limit,
            self.config.min_weighted_sum
        );

        let mut poll_interval = interval(TokioDuration::from_secs(
            self.config.poll_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    log::info!("[SCHEDULER] Received shutdown signal");
                    break;
                }
                _ = poll_interval.tick() => {
                    self.tick().await;
                }
            }
        }

        log::info!("[SCHEDULER] Stopped");
    }

    /// Process one tick of the scheduler
    async fn tick(&self) {
        let ctx = Arc::clone(&self.ctx);
        let config = self.config.clone();
        match tokio::task::spawn_blocking(move || run_cycle(&ctx, &config)).await {
            Ok(Ok(report)) => {
                if report.ingest.events_read > 0 || !report.completed.is_empty() || !report.failed.is_empty() {
                    log::info!(
                        "[SCHEDULER] Cycle: {} events ingested, {} runs completed, {} failed",
                        report.ingest.events_read,
                        report.completed.len(),
                        report.failed.len()
                    );
                }
            }
            Ok(Err(e)) => log::error!("[SCHEDULER] Cycle failed: {}", e),
            Err(e) => log::error!("[SCHEDULER] Cycle task panicked: {}", e),
        }
    }
}
