//! Pipeline orchestrator.
//!
//! Composes reader → masking → validation → per-destination fan-out:
//!
//! - One transform task drains `Qparse`, masks each event, validates it per
//!   destination, and enqueues one tagged copy per destination.
//! - Each destination owns `workers` bounded queues; the partition key hashes
//!   to a slot, so all events of one partition flow through one worker in
//!   source order.
//! - Workers accumulate batches bounded by size, bytes, and age, then run
//!   the destination write protocol under the retry policy. Terminal
//!   failures dead-letter the run and the offset advances only after the
//!   DLQ write succeeded.
//! - Backpressure is structural: full destination queues block the transform
//!   stage, which blocks the reader. A slow destination caps the pipeline
//!   without unbounded growth.
//!
//! Schema changes quiesce the affected table (bounded drain), apply DDL on
//! every destination in parallel, and latch a per-(destination, table)
//! quarantine when DDL fails. Shutdown is two-phase: stop the reader and
//! drain within a deadline, then close sinks; whatever misses the deadline
//! is simply replayed next start because its offsets never advanced.

use crate::config::ReplicatorConfig;
use crate::dlq::DlqWriter;
use crate::error::ErrorCategory;
use crate::health::{DependencyHealth, HealthStatus, SharedHealthState};
use crate::masking::MaskingRules;
use crate::metrics::SharedMetrics;
use crate::retry::{run_with_retry, RetryError, RetryPolicy};
use crate::sinks::{estimate_event_bytes, Sink};
use crate::validator::EventValidator;
use cassflow_cdc::{Advance, OffsetManager, ReaderItem, SchemaCache};
use cassflow_core::{
    ChangeEvent, DeadLetterEvent, Destination, LogPosition, OffsetKey, SchemaChange,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Bounded wait for a table's queued events to drain before DDL.
const SCHEMA_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Cadence of destination health probes.
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Orchestrator tunables derived from the configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_batch_age: Duration,
    pub workers_per_destination: usize,
    pub max_inflight_batches: usize,
    pub retry: RetryPolicy,
    pub dlq_write_timeout: Duration,
    pub shutdown_deadline: Duration,
}

impl PipelineConfig {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            batch_size: config.batch.batch_size,
            max_batch_bytes: config.batch.max_batch_bytes,
            max_batch_age: Duration::from_millis(config.batch.max_batch_age_ms),
            workers_per_destination: config.workers_per_destination,
            max_inflight_batches: config.max_inflight_batches_per_destination,
            retry: RetryPolicy::from_config(&config.retry),
            dlq_write_timeout: Duration::from_millis(config.dlq.write_timeout_ms),
            shutdown_deadline: Duration::from_millis(config.shutdown_deadline_ms),
        }
    }
}

#[cfg(test)]
impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&ReplicatorConfig::default())
    }
}

/// What the transform stage decided for one (event, destination) copy.
#[derive(Debug, Clone)]
enum Verdict {
    Deliver,
    DeadLetter {
        category: ErrorCategory,
        message: String,
    },
}

#[derive(Debug, Clone)]
struct WorkItem {
    event: ChangeEvent,
    token: LogPosition,
    verdict: Verdict,
}

/// Key of one per-partition run within a worker batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RunKey {
    keyspace: String,
    table: String,
    partition_id: i64,
}

type PendingMap = Arc<RwLock<HashMap<(Destination, String, String), u64>>>;

/// The assembled replication pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    sinks: Vec<Arc<dyn Sink>>,
    masking: Arc<MaskingRules>,
    validator: Arc<EventValidator>,
    offsets: Arc<OffsetManager>,
    dlq: Arc<DlqWriter>,
    metrics: SharedMetrics,
    health: SharedHealthState,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        sinks: Vec<Arc<dyn Sink>>,
        masking: Arc<MaskingRules>,
        schema_cache: SchemaCache,
        offsets: Arc<OffsetManager>,
        dlq: Arc<DlqWriter>,
        metrics: SharedMetrics,
        health: SharedHealthState,
    ) -> Self {
        Self {
            config,
            sinks,
            masking,
            validator: Arc::new(EventValidator::new(schema_cache)),
            offsets,
            dlq,
            metrics,
            health,
        }
    }

    /// Spawn the transform stage, destination workers, and the health
    /// prober. `reader_stop` is the sender half of the watch the reader
    /// (and schema monitor) subscribe to; the handle owns it for phase one
    /// of shutdown.
    pub fn start(
        self,
        mut reader_rx: mpsc::Receiver<ReaderItem>,
        mut schema_rx: mpsc::Receiver<SchemaChange>,
        reader_stop: watch::Sender<bool>,
    ) -> PipelineHandle {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None::<String>);

        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let backlog: HashMap<Destination, Arc<AtomicU64>> = self
            .sinks
            .iter()
            .map(|s| (s.destination(), Arc::new(AtomicU64::new(0))))
            .collect();

        // Per-destination, per-slot bounded queues. Qdest capacity is
        // maxInflightBatches · batchSize split across the slots.
        let slot_capacity = ((self.config.max_inflight_batches * self.config.batch_size)
            / self.config.workers_per_destination)
            .max(1);

        let mut worker_handles = Vec::new();
        let mut destination_slots: Vec<(Destination, Vec<mpsc::Sender<WorkItem>>)> = Vec::new();

        for sink in &self.sinks {
            let destination = sink.destination();
            let mut slots = Vec::with_capacity(self.config.workers_per_destination);
            for slot in 0..self.config.workers_per_destination {
                let (tx, rx) = mpsc::channel::<WorkItem>(slot_capacity);
                slots.push(tx);
                let ctx = WorkerContext {
                    destination,
                    slot,
                    sink: Arc::clone(sink),
                    offsets: Arc::clone(&self.offsets),
                    dlq: Arc::clone(&self.dlq),
                    metrics: Arc::clone(&self.metrics),
                    pending: Arc::clone(&pending),
                    backlog: Arc::clone(&backlog[&destination]),
                    policy: self.config.retry.clone(),
                    batch_size: self.config.batch_size,
                    max_batch_bytes: self.config.max_batch_bytes,
                    max_batch_age: self.config.max_batch_age,
                    dlq_write_timeout: self.config.dlq_write_timeout,
                    abort: abort_rx.clone(),
                    fatal: fatal_tx.clone(),
                };
                worker_handles.push(tokio::spawn(worker_loop(ctx, rx)));
            }
            destination_slots.push((destination, slots));
        }

        // Health prober.
        let prober = tokio::spawn(health_probe_loop(
            self.sinks.clone(),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
            backlog.clone(),
            abort_rx.clone(),
        ));

        // Transform stage.
        let transform = {
            let sinks = self.sinks.clone();
            let masking = Arc::clone(&self.masking);
            let validator = Arc::clone(&self.validator);
            let metrics = Arc::clone(&self.metrics);
            let health = Arc::clone(&self.health);
            let pending = Arc::clone(&pending);
            let backlog = backlog.clone();
            let policy = self.config.retry.clone();
            let abort = abort_rx.clone();
            tokio::spawn(async move {
                let mut schema_rx = Some(schema_rx);
                loop {
                    tokio::select! {
                        biased;
                        change = recv_or_never(&mut schema_rx), if schema_rx.is_some() => {
                            match change {
                                Some(change) => {
                                    handle_schema_change(
                                        &sinks, &validator, &health, &metrics, &pending,
                                        &policy, &abort, &change,
                                    )
                                    .await;
                                }
                                // monitor gone; keep replicating
                                None => schema_rx = None,
                            }
                        }
                        item = reader_rx.recv() => {
                            let Some(item) = item else { break };
                            match item {
                                ReaderItem::ParseSkip { file, position, reason } => {
                                    warn!(file = %file, position, reason = %reason, "skipping unparseable frame");
                                    metrics.record_parse_skip().await;
                                }
                                ReaderItem::Event { event, token } => {
                                    if transform_event(
                                        &destination_slots, &masking, &validator, &health,
                                        &pending, &backlog, &abort, event, token,
                                    )
                                    .await
                                    .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                // Dropping the slot senders lets workers flush and exit.
                drop(destination_slots);
                debug!("transform stage finished");
            })
        };

        let supervisor = tokio::spawn(async move {
            let _ = transform.await;
            for handle in worker_handles {
                let _ = handle.await;
            }
            prober.abort();
        });

        PipelineHandle {
            reader_stop,
            abort: abort_tx,
            fatal: fatal_rx,
            supervisor,
            sinks: self.sinks,
            health: self.health,
            shutdown_deadline: self.config.shutdown_deadline,
        }
    }
}

/// Running pipeline control handle.
pub struct PipelineHandle {
    reader_stop: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    fatal: watch::Receiver<Option<String>>,
    supervisor: JoinHandle<()>,
    sinks: Vec<Arc<dyn Sink>>,
    health: SharedHealthState,
    shutdown_deadline: Duration,
}

impl PipelineHandle {
    /// Watch that fires with a message when the pipeline hits a fatal,
    /// invariant-threatening failure.
    pub fn fatal_watch(&self) -> watch::Receiver<Option<String>> {
        self.fatal.clone()
    }

    /// Clear a quarantine latch so events for the table flow again.
    pub async fn clear_quarantine(&self, destination: Destination, table: &str) {
        self.health
            .write()
            .await
            .clear_quarantined(destination, table);
        info!(destination = %destination, table, "quarantine cleared");
    }

    /// Two-phase shutdown. Phase one stops the reader and drains in-flight
    /// work within the deadline; phase two closes sinks. Returns `true` if
    /// the drain finished cleanly. Unacknowledged events are not lost —
    /// their offsets were never advanced, so the next start replays them.
    pub async fn shutdown(mut self) -> bool {
        info!("pipeline shutdown: stopping reader and draining");
        let _ = self.reader_stop.send(true);

        let clean = timeout(self.shutdown_deadline, &mut self.supervisor)
            .await
            .is_ok();
        if !clean {
            warn!(
                deadline_ms = self.shutdown_deadline.as_millis() as u64,
                "drain deadline exceeded, aborting in-flight work"
            );
            let _ = self.abort.send(true);
            let _ = timeout(Duration::from_secs(5), &mut self.supervisor).await;
        }

        for sink in &self.sinks {
            sink.close().await;
        }
        info!(clean, "pipeline shutdown complete");
        clean
    }
}

async fn recv_or_never<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Mask, validate per destination, and enqueue to the hashed worker slot.
#[allow(clippy::too_many_arguments)]
async fn transform_event(
    destination_slots: &[(Destination, Vec<mpsc::Sender<WorkItem>>)],
    masking: &MaskingRules,
    validator: &EventValidator,
    health: &SharedHealthState,
    pending: &PendingMap,
    backlog: &HashMap<Destination, Arc<AtomicU64>>,
    abort: &watch::Receiver<bool>,
    event: ChangeEvent,
    token: LogPosition,
) -> Result<(), ()> {
    let (masked, _audits) = masking.mask_event(event);

    for (destination, slots) in destination_slots {
        let destination = *destination;
        let verdict = if health
            .read()
            .await
            .is_quarantined(destination, masked.table())
        {
            Verdict::DeadLetter {
                category: ErrorCategory::Quarantine,
                message: format!(
                    "destination {destination} is quarantined for table {}",
                    masked.table()
                ),
            }
        } else {
            let mapper = crate::mapper::TypeMapper::new(destination);
            match validator.validate(&masked, &mapper).await {
                Ok(()) => Verdict::Deliver,
                Err(e) => Verdict::DeadLetter {
                    category: e.category(),
                    message: e.to_string(),
                },
            }
        };

        let slot = (masked.partition_hash() as u64 % slots.len() as u64) as usize;
        let item = WorkItem {
            event: masked.clone(),
            token: token.clone(),
            verdict,
        };

        {
            let mut pending = pending.write().await;
            *pending
                .entry((
                    destination,
                    masked.keyspace().to_string(),
                    masked.table().to_string(),
                ))
                .or_insert(0) += 1;
        }
        backlog[&destination].fetch_add(1, Ordering::Relaxed);

        let mut abort = abort.clone();
        tokio::select! {
            res = slots[slot].send(item) => {
                if res.is_err() {
                    return Err(());
                }
            }
            _ = abort.changed() => {
                if *abort.borrow() {
                    return Err(());
                }
            }
        }
    }
    Ok(())
}

/// Quiesce the table, apply DDL everywhere in parallel, latch quarantine on
/// failure.
#[allow(clippy::too_many_arguments)]
async fn handle_schema_change(
    sinks: &[Arc<dyn Sink>],
    validator: &EventValidator,
    health: &SharedHealthState,
    metrics: &SharedMetrics,
    pending: &PendingMap,
    policy: &RetryPolicy,
    abort: &watch::Receiver<bool>,
    change: &SchemaChange,
) {
    info!(
        keyspace = %change.keyspace,
        table = %change.table,
        old_version = change.old_version,
        new_version = change.new_version,
        changes = change.changes.len(),
        "schema change: quiescing table"
    );

    // Columns a destination cannot follow: subsequent events touching them
    // are terminal for every destination and go to the DLQ un-retried.
    let incompatible: Vec<String> = change
        .incompatible_columns()
        .map(|c| c.column.clone())
        .collect();
    if !incompatible.is_empty() {
        warn!(
            table = %change.table,
            columns = ?incompatible,
            "incompatible schema change; affected events will be dead-lettered"
        );
        validator
            .mark_incompatible(&change.keyspace, &change.table, incompatible)
            .await;
    }

    // Wait for queued events of this table to drain, bounded so a wedged
    // sink cannot stall the pipeline forever. In-flight batches commit
    // under the old schema; that is the documented mid-batch behavior.
    let drained = timeout(SCHEMA_DRAIN_TIMEOUT, async {
        loop {
            let queued: u64 = {
                let pending = pending.read().await;
                pending
                    .iter()
                    .filter(|((_, ks, t), _)| *ks == change.keyspace && *t == change.table)
                    .map(|(_, v)| *v)
                    .sum()
            };
            if queued == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    if !drained {
        warn!(table = %change.table, "table did not drain before DDL, proceeding");
    }

    let results = join_all(sinks.iter().map(|sink| {
        let sink = Arc::clone(sink);
        async move {
            let destination = sink.destination();
            let outcome = run_with_retry(policy, abort, "apply_schema_change", |_| {
                let sink = Arc::clone(&sink);
                async move { sink.apply_schema_change(change).await }
            })
            .await;
            (destination, outcome)
        }
    }))
    .await;

    for (destination, outcome) in results {
        match outcome {
            Ok(()) => {
                info!(destination = %destination, table = %change.table, "DDL applied");
            }
            Err(RetryError::Cancelled) => {}
            Err(e) => {
                let (_, source) = e
                    .into_parts()
                    .expect("non-cancelled retry errors carry a source");
                error!(
                    destination = %destination,
                    table = %change.table,
                    error = %source,
                    "DDL failed, quarantining table for destination"
                );
                metrics
                    .record_error(destination, ErrorCategory::Quarantine.as_str())
                    .await;
                health
                    .write()
                    .await
                    .set_quarantined(destination, change.table.clone());
            }
        }
    }
}

struct WorkerContext {
    destination: Destination,
    slot: usize,
    sink: Arc<dyn Sink>,
    offsets: Arc<OffsetManager>,
    dlq: Arc<DlqWriter>,
    metrics: SharedMetrics,
    pending: PendingMap,
    backlog: Arc<AtomicU64>,
    policy: RetryPolicy,
    batch_size: usize,
    max_batch_bytes: usize,
    max_batch_age: Duration,
    dlq_write_timeout: Duration,
    abort: watch::Receiver<bool>,
    fatal: watch::Sender<Option<String>>,
}

/// Accumulate batches bounded by size, bytes, and age, then flush.
async fn worker_loop(mut ctx: WorkerContext, mut rx: mpsc::Receiver<WorkItem>) {
    debug!(destination = %ctx.destination, slot = ctx.slot, "sink worker started");
    let mut batch: Vec<WorkItem> = Vec::with_capacity(ctx.batch_size);
    let mut batch_bytes = 0usize;
    let mut deadline = tokio::time::Instant::now();

    loop {
        let item = if batch.is_empty() {
            // Nothing buffered: wait without an age deadline. An empty
            // batch aging out produces no write and no offset change.
            match rx.recv().await {
                Some(item) => item,
                None => break,
            }
        } else {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    flush_batch(&mut ctx, &mut batch, &mut batch_bytes).await;
                    continue;
                }
            }
        };

        if batch.is_empty() {
            deadline = tokio::time::Instant::now() + ctx.max_batch_age;
        }
        batch_bytes += estimate_event_bytes(&item.event);
        batch.push(item);

        if batch.len() >= ctx.batch_size || batch_bytes >= ctx.max_batch_bytes {
            flush_batch(&mut ctx, &mut batch, &mut batch_bytes).await;
        }

        if *ctx.abort.borrow() {
            break;
        }
    }

    // Channel closed: commit whatever is buffered before exiting.
    if !batch.is_empty() {
        flush_batch(&mut ctx, &mut batch, &mut batch_bytes).await;
    }
    debug!(destination = %ctx.destination, slot = ctx.slot, "sink worker finished");
}

/// Flush one accumulated batch as per-partition runs.
async fn flush_batch(ctx: &mut WorkerContext, batch: &mut Vec<WorkItem>, batch_bytes: &mut usize) {
    let items = std::mem::take(batch);
    *batch_bytes = 0;
    if items.is_empty() {
        return;
    }

    // A batch is a contiguous run of events from one partition; slots carry
    // several partitions, so split into per-partition runs, order preserved
    // within each.
    let mut runs: Vec<(RunKey, Vec<WorkItem>)> = Vec::new();
    for item in items {
        let key = RunKey {
            keyspace: item.event.keyspace().to_string(),
            table: item.event.table().to_string(),
            partition_id: item.event.partition_hash(),
        };
        match runs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, run)) => run.push(item),
            None => runs.push((key, vec![item])),
        }
    }

    for (key, run) in runs {
        flush_run(ctx, key, run).await;
    }
}

async fn flush_run(ctx: &mut WorkerContext, key: RunKey, run: Vec<WorkItem>) {
    let destination = ctx.destination;
    let run_len = run.len() as u64;
    let last_token = run.last().expect("runs are non-empty").token.clone();
    let max_ts = run
        .iter()
        .map(|i| i.event.timestamp_micros())
        .max()
        .expect("runs are non-empty");

    let mut deliver: Vec<ChangeEvent> = Vec::new();
    let mut dead: Vec<(ChangeEvent, ErrorCategory, String)> = Vec::new();
    for item in run {
        match item.verdict {
            Verdict::Deliver => deliver.push(item.event),
            Verdict::DeadLetter { category, message } => {
                dead.push((item.event, category, message));
            }
        }
    }

    let offset_key = OffsetKey::new(
        key.table.clone(),
        key.keyspace.clone(),
        key.partition_id,
        destination,
    );

    let outcome = ctx
        .offsets
        .advance(&offset_key, last_token, max_ts, deliver.len() as u64)
        .await;
    let advance = match outcome {
        Ok(advance) => advance,
        Err(e) => {
            // Positions inside one partition run never regress, so this is
            // an internal invariant break, not an operational error.
            signal_fatal(ctx, format!("offset advance failed: {e}")).await;
            return;
        }
    };

    match advance {
        Advance::Duplicate => {
            debug!(
                destination = %destination,
                table = %key.table,
                "duplicate replay run skipped"
            );
        }
        Advance::Advanced(next_offset) => {
            // DLQ first: giving up on an event is acknowledged by the DLQ
            // write, and only then may the offset move past it.
            for (event, category, message) in &dead {
                if !write_dead_letter(ctx, event.clone(), *category, message.clone(), 0).await {
                    release_counters(ctx, &key, run_len).await;
                    return;
                }
            }

            let attempt_metrics = Arc::clone(&ctx.metrics);
            let sink = Arc::clone(&ctx.sink);
            let events = deliver.clone();
            let offset = next_offset.clone();
            let write = run_with_retry(&ctx.policy, &ctx.abort, "write_batch", move |attempt| {
                let sink = Arc::clone(&sink);
                let events = events.clone();
                let offset = offset.clone();
                let metrics = Arc::clone(&attempt_metrics);
                async move {
                    if attempt > 1 {
                        metrics.record_retry(sink.destination()).await;
                    }
                    sink.write_batch(&events, &offset).await
                }
            })
            .await;

            match write {
                Ok(_) => {
                    ctx.offsets.commit(next_offset).await;
                    ctx.metrics
                        .record_processed(destination, &key.table, deliver.len() as u64)
                        .await;
                    let lag =
                        (Utc::now().timestamp_micros() - max_ts).max(0) as f64 / 1_000_000.0;
                    ctx.metrics.set_lag_seconds(destination, lag).await;
                    ctx.metrics
                        .set_events_per_second(
                            destination,
                            ctx.sink.stats().events_per_second,
                        )
                        .await;
                }
                Err(RetryError::Cancelled) => {
                    // Not acknowledged; offsets unchanged, replay on restart.
                    release_counters(ctx, &key, run_len).await;
                    return;
                }
                Err(failure) => {
                    let (attempts, source) = failure
                        .into_parts()
                        .expect("non-cancelled retry errors carry a source");
                    let category = match source.category() {
                        ErrorCategory::Transient => ErrorCategory::Terminal,
                        other => other,
                    };
                    ctx.metrics.record_error(destination, category.as_str()).await;
                    if category == ErrorCategory::Fatal {
                        signal_fatal(ctx, source.to_string()).await;
                        release_counters(ctx, &key, run_len).await;
                        return;
                    }

                    warn!(
                        destination = %destination,
                        table = %key.table,
                        attempts,
                        error = %source,
                        "batch failed terminally, dead-lettering run"
                    );
                    for event in deliver {
                        if !write_dead_letter(
                            ctx,
                            event,
                            category,
                            source.to_string(),
                            attempts,
                        )
                        .await
                        {
                            release_counters(ctx, &key, run_len).await;
                            return;
                        }
                    }

                    // The DLQ now owns the run; record that by advancing the
                    // offset with an offset-only write. If even that cannot
                    // reach the store, halting is the only way to keep the
                    // exactly-once-or-DLQ invariant.
                    let sink = Arc::clone(&ctx.sink);
                    let offset = next_offset.clone();
                    let advance_only =
                        run_with_retry(&ctx.policy, &ctx.abort, "advance_offset", move |_| {
                            let sink = Arc::clone(&sink);
                            let offset = offset.clone();
                            async move { sink.write_batch(&[], &offset).await }
                        })
                        .await;
                    match advance_only {
                        Ok(_) => ctx.offsets.commit(next_offset).await,
                        Err(RetryError::Cancelled) => {}
                        Err(e) => {
                            let msg = e
                                .into_parts()
                                .map(|(_, src)| src.to_string())
                                .unwrap_or_else(|| "cancelled".into());
                            signal_fatal(
                                ctx,
                                format!("offset store unreachable after DLQ: {msg}"),
                            )
                            .await;
                        }
                    }
                }
            }
        }
    }

    release_counters(ctx, &key, run_len).await;
}

/// Append one DLQ record within the bounded, non-cancellable write window.
/// Returns `false` after signalling fatal when the write cannot complete.
async fn write_dead_letter(
    ctx: &WorkerContext,
    event: ChangeEvent,
    category: ErrorCategory,
    message: String,
    retry_count: u32,
) -> bool {
    let record = DeadLetterEvent::new(
        event,
        ctx.destination,
        category.as_str(),
        message,
        retry_count,
        Utc::now(),
    );
    ctx.metrics
        .record_dlq(ctx.destination, category.as_str())
        .await;
    match timeout(ctx.dlq_write_timeout, ctx.dlq.write(&record)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            signal_fatal(ctx, format!("DLQ write failed: {e}")).await;
            false
        }
        Err(_) => {
            signal_fatal(ctx, "DLQ write timed out".to_string()).await;
            false
        }
    }
}

async fn signal_fatal(ctx: &WorkerContext, message: String) {
    error!(destination = %ctx.destination, message = %message, "fatal pipeline failure");
    ctx.metrics
        .record_error(ctx.destination, ErrorCategory::Fatal.as_str())
        .await;
    let _ = ctx.fatal.send(Some(message));
}

async fn release_counters(ctx: &WorkerContext, key: &RunKey, count: u64) {
    {
        let mut pending = ctx.pending.write().await;
        if let Some(entry) =
            pending.get_mut(&(ctx.destination, key.keyspace.clone(), key.table.clone()))
        {
            *entry = entry.saturating_sub(count);
        }
    }
    ctx.backlog.fetch_sub(count, Ordering::Relaxed);
    ctx.metrics
        .set_backlog_depth(ctx.destination, ctx.backlog.load(Ordering::Relaxed))
        .await;
}

/// Periodic destination probes feeding the health surface.
async fn health_probe_loop(
    sinks: Vec<Arc<dyn Sink>>,
    health: SharedHealthState,
    metrics: SharedMetrics,
    backlog: HashMap<Destination, Arc<AtomicU64>>,
    abort: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(HEALTH_PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if *abort.borrow() {
            return;
        }
        for sink in &sinks {
            let destination = sink.destination();
            let dep = match sink.health_check().await {
                Ok(latency) => DependencyHealth {
                    status: HealthStatus::Healthy,
                    latency_ms: latency.as_secs_f64() * 1000.0,
                    error: None,
                },
                Err(e) => DependencyHealth {
                    status: HealthStatus::Unhealthy,
                    latency_ms: 0.0,
                    error: Some(e.to_string()),
                },
            };
            health
                .write()
                .await
                .set_dependency(destination.label(), dep);
            metrics
                .set_backlog_depth(destination, backlog[&destination].load(Ordering::Relaxed))
                .await;
            metrics
                .set_events_per_second(destination, sink.stats().events_per_second)
                .await;
        }
    }
}
