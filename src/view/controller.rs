//! Pipeline lifecycle controller
//!
//! One actor task owns all state of a publication (identities, snapshot,
//! throttle, expiry scheduler, feeds). Change notifications, timers, rebuild
//! requests and recompute completions are serialized through a single
//! `tokio::select!` loop, so reconciliation never runs concurrently with
//! itself.
//!
//! Pipeline execution is spawned off the loop. While a job is in flight,
//! further recompute requests only set a rerun flag: exactly one more
//! recompute follows the in-flight one, however many requests arrived.
//!
//! ```text
//!   source feed ──► on_change ──► throttle ──┐
//!                        │                   ├──► spawn job ──► execute ─┐
//!                        └──► expiry timer ──┘                            │
//!   rebuild feed ──► rebuild (retract all, new generation, re-prepare)    │
//!   completion ◄──────────────────────────────────────────────────────────┘
//!        └──► Reconciler ──► sink (added / changed / removed) ──► expiry.arm
//! ```

use super::error::{ConstructionError, ViewError};
use super::expiry::{ExpiryScheduler, ExpiryState, MatchWindowState, OldestRow};
use super::identity::IdentityManager;
use super::options::{Clock, PipelineBuilder, ViewOptions};
use super::pipeline::Pipeline;
use super::reconcile::{Comparison, Delta, Reconciler};
use super::sink::ViewSink;
use super::snapshot::ViewSnapshot;
use super::throttle::RecomputeThrottle;
use super::timer::expired;
use super::types::ResultRow;
use crate::store::{ChangeEvent, ChangeFeed, PipelineExecutor, SourceStore, StoreError};
use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

/// A derived view over a source store, ready to be started
pub struct ViewPublication {
    source: Arc<dyn SourceStore>,
    executor: Arc<dyn PipelineExecutor>,
    builder: PipelineBuilder,
    options: ViewOptions,
}

impl ViewPublication {
    /// Publication over a store that also executes pipelines
    pub fn new<S>(store: Arc<S>, builder: impl Fn() -> Option<Pipeline> + Send + Sync + 'static) -> Self
    where
        S: SourceStore + PipelineExecutor + 'static,
    {
        Self::with_parts(store.clone(), store, Arc::new(builder))
    }

    pub fn with_parts(
        source: Arc<dyn SourceStore>,
        executor: Arc<dyn PipelineExecutor>,
        builder: PipelineBuilder,
    ) -> Self {
        Self {
            source,
            executor,
            builder,
            options: ViewOptions::default(),
        }
    }

    pub fn options(mut self, options: ViewOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the pipeline, run the first full reconciliation, signal ready and
    /// hand the publication to its actor task.
    ///
    /// Construction and initial execution errors are returned here; nothing
    /// keeps running on failure.
    pub async fn start(self, sink: Arc<dyn ViewSink>) -> Result<ViewHandle, ViewError> {
        let view_name = self
            .options
            .view_name
            .clone()
            .unwrap_or_else(|| self.source.name().to_string());

        let rebuild_feed = match &self.options.rebuild_trigger {
            Some(trigger) => Some(trigger.store.subscribe_changes(&trigger.filter)?),
            None => None,
        };

        let mut actor = ViewActor {
            view_name: view_name.clone(),
            source: self.source,
            executor: self.executor,
            builder: self.builder,
            clock: self.options.clock.clone(),
            sink,
            identities: IdentityManager::new(),
            snapshot: ViewSnapshot::new(),
            throttle: RecomputeThrottle::from_millis(self.options.min_recompute_interval_millis),
            pipeline: None,
            comparison: Comparison::Presence,
            expiry: None,
            feed: None,
            rebuild_feed,
            inflight: None,
            rerun: false,
            options: self.options,
        };

        actor.prepare()?;
        actor.initial_pass().await?;
        actor.sink.ready(&view_name);
        log::info!(
            "✅ View '{}' ready ({} rows, {:?})",
            view_name,
            actor.snapshot.len(),
            actor.comparison
        );

        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(actor.run(rx));

        Ok(ViewHandle {
            view_name,
            commands,
            task,
        })
    }
}

#[derive(Debug)]
enum Command {
    Rebuild,
    Stop,
}

/// Control handle for a running publication. Dropping it stops the view.
pub struct ViewHandle {
    view_name: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ViewHandle {
    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    /// Request a full rebuild, as if the rebuild trigger had fired
    pub fn rebuild(&self) -> Result<(), ViewError> {
        self.commands
            .send(Command::Rebuild)
            .map_err(|_| ViewError::Stopped)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Tear down and wait until every published row has been retracted
    pub async fn stop(self) -> Result<(), ViewError> {
        // Send fails only if the actor already exited
        let _ = self.commands.send(Command::Stop);
        self.task.await.map_err(|_| ViewError::Stopped)
    }
}

/// Result of one pipeline run
struct Outcome {
    rows: Vec<ResultRow>,
    oldest: Option<OldestRow>,
}

type JobResult = Result<Result<Outcome, StoreError>, JoinError>;

struct InFlight {
    generation: u32,
    handle: JoinHandle<Result<Outcome, StoreError>>,
}

struct ViewActor {
    view_name: String,
    source: Arc<dyn SourceStore>,
    executor: Arc<dyn PipelineExecutor>,
    builder: PipelineBuilder,
    options: ViewOptions,
    clock: Clock,
    sink: Arc<dyn ViewSink>,

    identities: IdentityManager,
    snapshot: ViewSnapshot,
    throttle: RecomputeThrottle,

    /// Current pipeline; `None` while the builder yields nothing
    pipeline: Option<Pipeline>,
    comparison: Comparison,
    expiry: Option<ExpiryScheduler>,
    feed: Option<ChangeFeed>,
    rebuild_feed: Option<ChangeFeed>,

    inflight: Option<InFlight>,

    /// A recompute was requested while one was in flight
    rerun: bool,
}

impl ViewActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let throttle_deadline = self.throttle.deadline();
            let expiry_deadline = self.expiry.as_ref().and_then(|e| e.deadline());

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Rebuild) => {
                        if !self.rebuild() {
                            break;
                        }
                    }
                    Some(Command::Stop) | None => break,
                },
                event = recv_feed(&mut self.feed) => self.on_change(event),
                _ = recv_feed(&mut self.rebuild_feed) => {
                    let coalesced = self.rebuild_feed.as_mut().map_or(0, |feed| feed.drain());
                    log::debug!("Rebuild trigger fired ({} further events coalesced)", coalesced);
                    if !self.rebuild() {
                        break;
                    }
                }
                _ = expired(throttle_deadline) => self.on_throttle(),
                _ = expired(expiry_deadline) => self.on_expiry(),
                (generation, result) = join_inflight(&mut self.inflight) => {
                    self.on_completed(generation, result);
                }
            }
        }

        self.teardown();
    }

    /// Build the pipeline for the current generation and subscribe its feed
    fn prepare(&mut self) -> Result<(), ViewError> {
        if let Some(window) = &self.options.window {
            if window.width_millis <= 0 {
                return Err(ConstructionError::InvalidWindow(format!(
                    "width must be positive, got {}ms",
                    window.width_millis
                ))
                .into());
            }
        }

        let mut pipeline = (self.builder)();
        let comparison = detect_comparison(pipeline.as_ref(), self.options.single_value_field.as_deref())?;

        let expiry = self.options.window.as_ref().map(|window| {
            if let Some(pipeline) = pipeline.as_mut() {
                pipeline.ensure_record_match();
            }
            ExpiryScheduler::new(window)
        });

        let feed = match &pipeline {
            Some(_) => {
                let filter = self
                    .options
                    .change_feed_filter
                    .as_ref()
                    .map(|filter| filter())
                    .unwrap_or_default();
                Some(self.source.subscribe_changes(&filter)?)
            }
            None => {
                log::warn!("⚠️  View '{}' has no active pipeline", self.view_name);
                None
            }
        };

        self.pipeline = pipeline;
        self.comparison = comparison;
        self.expiry = expiry;
        self.feed = feed;
        Ok(())
    }

    async fn initial_pass(&mut self) -> Result<(), ViewError> {
        let Some(pipeline) = self.pipeline.clone() else {
            return Ok(());
        };
        let window = self.expiry.as_ref().map(|e| e.window().clone());
        let now = (self.clock)();
        let outcome = compute(self.source.clone(), self.executor.clone(), pipeline, window, now).await?;
        self.apply(outcome);
        Ok(())
    }

    fn on_change(&mut self, event: ChangeEvent) {
        let needs_refresh = self.expiry.as_ref().map_or(true, |e| e.needs_refresh());
        if self.throttle.is_pending() && needs_refresh {
            self.throttle.trigger();
            return;
        }

        match &event {
            ChangeEvent::Added { key, record } => {
                if let Some(expiry) = self.expiry.as_mut() {
                    let now = (self.clock)();
                    let field = &expiry.window().field;
                    match record.timestamp(field) {
                        Some(ts) if expiry.window().contains(ts, now) => {
                            expiry.observe_added(key, ts, now);
                        }
                        _ => {
                            log::debug!("Ignoring {} outside the window", key);
                            return;
                        }
                    }
                }
            }
            ChangeEvent::Removed { key } => {
                if let Some(expiry) = self.expiry.as_mut() {
                    expiry.observe_removed(key);
                }
            }
        }

        self.throttle.trigger();
    }

    fn on_throttle(&mut self) {
        if let Some(coalesced) = self.throttle.fire() {
            if coalesced > 0 {
                log::debug!("📊 Recompute of '{}' coalesced {} triggers", self.view_name, coalesced);
            }
            self.spawn_recompute();
        }
    }

    fn on_expiry(&mut self) {
        let Some(expiry) = self.expiry.as_mut() else {
            return;
        };
        if !expiry.fire() {
            return;
        }
        log::debug!("⏰ Oldest row of '{}' left the window", self.view_name);
        // The expiry recompute reads the store now, covering any pending run
        self.throttle.cancel();
        self.spawn_recompute();
    }

    fn spawn_recompute(&mut self) {
        if self.inflight.is_some() {
            self.rerun = true;
            return;
        }
        let Some(pipeline) = self.pipeline.clone() else {
            return;
        };

        let window = self.expiry.as_ref().map(|e| e.window().clone());
        let now = (self.clock)();
        let source = self.source.clone();
        let executor = self.executor.clone();
        let handle = tokio::spawn(compute(source, executor, pipeline, window, now));

        self.inflight = Some(InFlight {
            generation: self.identities.generation(),
            handle,
        });
    }

    fn on_completed(&mut self, generation: u32, result: JobResult) {
        match result {
            Ok(Ok(outcome)) if generation == self.identities.generation() => self.apply(outcome),
            Ok(Ok(_)) => log::debug!("Discarding result of generation {}", generation),
            Ok(Err(e)) => self.on_failed(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => self.on_failed(StoreError::Task(e.to_string())),
        }

        if std::mem::take(&mut self.rerun) {
            self.spawn_recompute();
        }
    }

    fn on_failed(&mut self, error: StoreError) {
        log::error!("❌ Recompute of '{}' failed, keeping last view: {}", self.view_name, error);
        self.sink.failed(&self.view_name, &error.to_string());
        if let Some(expiry) = self.expiry.as_mut() {
            if expiry.state() == ExpiryState::Firing {
                expiry.abandon();
            }
        }
    }

    fn apply(&mut self, outcome: Outcome) {
        let deltas = Reconciler {
            identities: &mut self.identities,
            snapshot: &mut self.snapshot,
            comparison: &self.comparison,
            transform: self.options.transform.as_ref(),
        }
        .reconcile(outcome.rows);
        self.publish(deltas);

        if let Some(expiry) = self.expiry.as_mut() {
            expiry.arm(outcome.oldest, (self.clock)());
        }
    }

    fn publish(&self, deltas: Vec<Delta>) {
        for delta in deltas {
            match delta {
                Delta::Added { id, row } => self.sink.added(&self.view_name, id, row),
                Delta::Changed { id, row } => self.sink.changed(&self.view_name, id, row),
                Delta::Removed { id } => self.sink.removed(&self.view_name, id),
            }
        }
    }

    fn unpublish_all(&mut self) -> usize {
        let ids = self.snapshot.ids();
        for id in &ids {
            self.snapshot.remove(id);
            self.identities.release_id(id);
            self.sink.removed(&self.view_name, *id);
        }
        ids.len()
    }

    /// Cancel timers, abort running work and stop the source feed
    fn quiesce(&mut self) {
        self.throttle.cancel();
        if let Some(job) = self.inflight.take() {
            job.handle.abort();
        }
        self.rerun = false;
        if let Some(expiry) = self.expiry.as_mut() {
            expiry.cancel();
        }
        self.expiry = None;
        if let Some(feed) = self.feed.take() {
            feed.stop();
        }
    }

    fn next_generation(&mut self) {
        self.identities.reset();
        self.snapshot.advance(self.identities.generation());
        self.snapshot.purge_stale();
    }

    /// Full rebuild: retract everything, start a fresh identity generation and
    /// recompute with a newly built pipeline. Returns false when the new
    /// pipeline could not be constructed and the publication must end.
    fn rebuild(&mut self) -> bool {
        log::info!("🔄 Rebuilding view '{}'", self.view_name);
        self.quiesce();
        let retracted = self.unpublish_all();
        self.next_generation();

        match self.prepare() {
            Ok(()) => {
                log::debug!(
                    "View '{}' rebuilt: {} rows retracted, generation {}",
                    self.view_name,
                    retracted,
                    self.identities.generation()
                );
                self.spawn_recompute();
                true
            }
            Err(e) => {
                log::error!("❌ Rebuild of '{}' failed: {}", self.view_name, e);
                self.sink.failed(&self.view_name, &e.to_string());
                self.pipeline = None;
                false
            }
        }
    }

    fn teardown(&mut self) {
        self.quiesce();
        if let Some(feed) = self.rebuild_feed.take() {
            feed.stop();
        }
        let retracted = self.unpublish_all();
        self.next_generation();
        log::info!("🛑 View '{}' stopped ({} rows retracted)", self.view_name, retracted);
    }
}

/// Decide how rows are compared between passes
fn detect_comparison(
    pipeline: Option<&Pipeline>,
    forced: Option<&str>,
) -> Result<Comparison, ConstructionError> {
    let descriptor = pipeline.and_then(Pipeline::descriptor);
    match (forced, descriptor) {
        (Some(field), Some(descriptor)) => {
            if descriptor.output_fields.iter().any(|f| f == field) {
                Ok(Comparison::Field(field.to_string()))
            } else {
                Err(ConstructionError::UnknownSingleValueField(field.to_string()))
            }
        }
        (Some(field), None) => Ok(Comparison::Field(field.to_string())),
        (None, Some(descriptor)) => Ok(descriptor
            .single_value_field()
            .map_or(Comparison::Presence, |field| Comparison::Field(field.to_string()))),
        (None, None) if pipeline.is_some() => Err(ConstructionError::MissingGroupStage),
        (None, None) => Ok(Comparison::Presence),
    }
}

/// Run the pipeline (bounded to the window at `now`) and, in window mode,
/// look up the oldest in-window record.
async fn compute(
    source: Arc<dyn SourceStore>,
    executor: Arc<dyn PipelineExecutor>,
    mut pipeline: Pipeline,
    window: Option<MatchWindowState>,
    now: i64,
) -> Result<Outcome, StoreError> {
    if let Some(window) = &window {
        window.apply(&mut pipeline, now);
    }
    let rows = executor.execute(&pipeline).await?;

    let oldest = match &window {
        Some(window) => {
            let (filter, options) = window.oldest_query(&pipeline);
            source
                .find(&filter, &options)
                .await?
                .first()
                .and_then(|record| OldestRow::from_record(record, &window.field))
        }
        None => None,
    };

    Ok(Outcome { rows, oldest })
}

/// Next event of an optional feed; pends forever once the feed is gone
async fn recv_feed(feed: &mut Option<ChangeFeed>) -> ChangeEvent {
    if let Some(active) = feed.as_mut() {
        if let Some(event) = active.recv().await {
            return event;
        }
        log::warn!("⚠️  Change feed closed by the store");
        *feed = None;
    }
    pending().await
}

async fn join_inflight(inflight: &mut Option<InFlight>) -> (u32, JobResult) {
    let Some(job) = inflight.as_mut() else {
        return pending().await;
    };
    let result = (&mut job.handle).await;
    let generation = job.generation;
    *inflight = None;
    (generation, result)
}
