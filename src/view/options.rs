//! Publication options

use super::expiry::WindowSpec;
use super::pipeline::{Filter, Pipeline};
use super::reconcile::RowTransform;
use crate::store::SourceStore;
use std::sync::Arc;

/// Wall clock in epoch milliseconds
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Re-evaluated on every (re)build
pub type FilterFn = Arc<dyn Fn() -> Filter + Send + Sync>;

/// Returns a fresh pipeline, or `None` while no pipeline is active
pub type PipelineBuilder = Arc<dyn Fn() -> Option<Pipeline> + Send + Sync>;

pub const DEFAULT_MIN_RECOMPUTE_MS: u64 = 500;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Feed whose changes force a full rebuild
#[derive(Clone)]
pub struct RebuildTrigger {
    pub store: Arc<dyn SourceStore>,
    pub filter: Filter,
}

impl RebuildTrigger {
    pub fn new(store: Arc<dyn SourceStore>, filter: Filter) -> Self {
        Self { store, filter }
    }
}

#[derive(Clone)]
pub struct ViewOptions {
    /// Defaults to the source store's name
    pub view_name: Option<String>,

    /// Restricts which source changes drive recomputes; all records if unset
    pub change_feed_filter: Option<FilterFn>,

    /// Applied to emitted rows only, never to comparison values
    pub transform: Option<RowTransform>,

    /// Overrides automatic single-value detection
    pub single_value_field: Option<String>,

    pub window: Option<WindowSpec>,

    pub min_recompute_interval_millis: u64,

    pub rebuild_trigger: Option<RebuildTrigger>,

    pub clock: Clock,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            view_name: None,
            change_feed_filter: None,
            transform: None,
            single_value_field: None,
            window: None,
            min_recompute_interval_millis: DEFAULT_MIN_RECOMPUTE_MS,
            rebuild_trigger: None,
            clock: system_clock(),
        }
    }
}

impl ViewOptions {
    pub fn view_name(mut self, name: &str) -> Self {
        self.view_name = Some(name.to_string());
        self
    }

    pub fn change_feed_filter(mut self, filter: impl Fn() -> Filter + Send + Sync + 'static) -> Self {
        self.change_feed_filter = Some(Arc::new(filter));
        self
    }

    pub fn transform(mut self, transform: RowTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn single_value_field(mut self, field: &str) -> Self {
        self.single_value_field = Some(field.to_string());
        self
    }

    pub fn window(mut self, field: &str, width_millis: i64) -> Self {
        self.window = Some(WindowSpec::new(field, width_millis));
        self
    }

    pub fn min_recompute_interval_millis(mut self, millis: u64) -> Self {
        self.min_recompute_interval_millis = millis;
        self
    }

    pub fn rebuild_trigger(mut self, trigger: RebuildTrigger) -> Self {
        self.rebuild_trigger = Some(trigger);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for ViewOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewOptions")
            .field("view_name", &self.view_name)
            .field("single_value_field", &self.single_value_field)
            .field("window", &self.window)
            .field("min_recompute_interval_millis", &self.min_recompute_interval_millis)
            .field("rebuild_trigger", &self.rebuild_trigger.is_some())
            .finish_non_exhaustive()
    }
}
