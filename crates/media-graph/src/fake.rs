//! In-process backend that simulates pipelines without touching hardware.
//!
//! Pipelines built here move through states on tokio's clock and report a
//! live activity stamp while PLAYING. A [`FakeControl`] handle scripts
//! faults: hung transitions, failing builds, stalled buffers and bus
//! messages. Dry runs and all state-machine tests use it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use scenemix_common::error::{ScenemixError, ScenemixResult};
use tokio::time::Instant;

use crate::backend::{
    BusEvent, BusSeverity, MediaPipeline, PadProperties, PipelineBackend, PipelineState,
};
use crate::graph::{PipelineGraph, PropValue};

/// One recorded `build` call.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub name: String,
    pub launch: String,
    pub graph: PipelineGraph,
}

#[derive(Default)]
struct ControlState {
    transition_delay: Duration,
    hang_transitions: Vec<(String, u32)>,
    fail_transitions: Vec<(String, u32)>,
    fail_builds: Vec<(String, u32)>,
    builds: Vec<BuildRecord>,
    live: Vec<Weak<PipelineCore>>,
}

impl ControlState {
    fn live(&self) -> impl Iterator<Item = Arc<PipelineCore>> + '_ {
        self.live.iter().filter_map(Weak::upgrade)
    }
}

/// Consume one scripted fault for `name`, if any is armed.
fn take_fault(faults: &mut Vec<(String, u32)>, name: &str) -> bool {
    let Some(idx) = faults.iter().position(|(prefix, n)| *n > 0 && name.starts_with(prefix.as_str()))
    else {
        return false;
    };
    faults[idx].1 -= 1;
    if faults[idx].1 == 0 {
        faults.remove(idx);
    }
    true
}

/// Script handle shared with every pipeline the backend builds.
#[derive(Clone, Default)]
pub struct FakeControl {
    inner: Arc<Mutex<ControlState>>,
}

impl FakeControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Delay applied to every transition away from NULL.
    pub fn set_transition_delay(&self, delay: Duration) {
        self.lock().transition_delay = delay;
    }

    /// The next `count` transitions (other than to NULL) on pipelines whose
    /// name starts with `prefix` never complete.
    pub fn hang_transitions(&self, prefix: &str, count: u32) {
        self.lock().hang_transitions.push((prefix.to_string(), count));
    }

    /// The next `count` transitions to PLAYING fail immediately with a bus
    /// error, as a busy or absent device would.
    pub fn fail_transitions(&self, prefix: &str, count: u32) {
        self.lock().fail_transitions.push((prefix.to_string(), count));
    }

    /// The next `count` builds of matching pipelines are refused.
    pub fn fail_builds(&self, prefix: &str, count: u32) {
        self.lock().fail_builds.push((prefix.to_string(), count));
    }

    /// Disarm every scripted fault.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.hang_transitions.clear();
        state.fail_transitions.clear();
        state.fail_builds.clear();
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        self.lock().builds.clone()
    }

    /// Number of builds of pipelines whose name starts with `prefix`.
    pub fn build_count(&self, prefix: &str) -> usize {
        self.lock()
            .builds
            .iter()
            .filter(|b| b.name.starts_with(prefix))
            .count()
    }

    /// Most recent build of a matching pipeline.
    pub fn last_build(&self, prefix: &str) -> Option<BuildRecord> {
        self.lock()
            .builds
            .iter()
            .rev()
            .find(|b| b.name.starts_with(prefix))
            .cloned()
    }

    /// Freeze buffer flow on live matching pipelines. Pipelines built later
    /// are unaffected.
    pub fn stall(&self, prefix: &str) {
        let now = Instant::now();
        for core in self.lock().live() {
            if core.name.starts_with(prefix) {
                core.lock().stall(now);
            }
        }
    }

    /// Resume buffer flow on live matching pipelines.
    pub fn resume(&self, prefix: &str) {
        for core in self.lock().live() {
            if core.name.starts_with(prefix) {
                core.lock().stalled = false;
            }
        }
    }

    /// Post `event` on live matching pipelines. Errors also stop buffer flow.
    pub fn inject_bus_event(&self, prefix: &str, event: BusEvent) {
        let now = Instant::now();
        for core in self.lock().live() {
            if core.name.starts_with(prefix) {
                let mut state = core.lock();
                if event.severity == BusSeverity::Error {
                    state.stall(now);
                }
                state.events.push(event.clone());
            }
        }
    }

    /// Post `event` on live matching pipelines without touching buffer flow,
    /// as when one branch of a compositing pipeline fails and the rest keep
    /// running.
    pub fn post_bus_event(&self, prefix: &str, event: BusEvent) {
        for core in self.lock().live() {
            if core.name.starts_with(prefix) {
                core.lock().events.push(event.clone());
            }
        }
    }

    /// Live (not dropped) pipelines with their states.
    pub fn live_pipelines(&self) -> Vec<(String, PipelineState)> {
        self.lock()
            .live()
            .map(|core| {
                let state = core.lock().state;
                (core.name.clone(), state)
            })
            .collect()
    }

    /// Live pipelines holding `device` open (any state above NULL).
    pub fn open_device_handles(&self, device: &str) -> usize {
        self.lock()
            .live()
            .filter(|core| core.lock().state != PipelineState::Null)
            .filter(|core| {
                core.graph.elements().any(|e| {
                    e.factory() == "v4l2src" && e.get("device").and_then(PropValue::as_str) == Some(device)
                })
            })
            .count()
    }

    /// Pad writes recorded on live matching pipelines, oldest first.
    pub fn pad_writes(&self, prefix: &str) -> Vec<(String, String, PadProperties)> {
        let mut writes = Vec::new();
        for core in self.lock().live() {
            if core.name.starts_with(prefix) {
                writes.extend(core.lock().pads.iter().cloned());
            }
        }
        writes
    }
}

/// Backend handing out [`FakePipeline`]s.
#[derive(Clone, Default)]
pub struct FakeBackend {
    control: FakeControl,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> FakeControl {
        self.control.clone()
    }
}

impl PipelineBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn build(&self, graph: &PipelineGraph) -> ScenemixResult<Arc<dyn MediaPipeline>> {
        let launch = graph.compile()?;
        let mut state = self.control.lock();
        state.builds.push(BuildRecord {
            name: graph.name().to_string(),
            launch,
            graph: graph.clone(),
        });
        if take_fault(&mut state.fail_builds, graph.name()) {
            return Err(ScenemixError::pipeline_build(format!(
                "scripted build failure for {}",
                graph.name()
            )));
        }

        let core = Arc::new(PipelineCore {
            name: graph.name().to_string(),
            graph: graph.clone(),
            state: Mutex::new(CoreState::default()),
        });
        state.live.retain(|w| w.strong_count() > 0);
        state.live.push(Arc::downgrade(&core));
        tracing::debug!(pipeline = graph.name(), "Fake pipeline built");

        Ok(Arc::new(FakePipeline {
            core,
            control: self.control.clone(),
        }))
    }
}

struct PipelineCore {
    name: String,
    graph: PipelineGraph,
    state: Mutex<CoreState>,
}

impl PipelineCore {
    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct CoreState {
    state: PipelineState,
    stalled: bool,
    /// Activity frozen when the pipeline stopped flowing.
    last_seen: Option<Instant>,
    events: Vec<BusEvent>,
    pads: Vec<(String, String, PadProperties)>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self {
            state: PipelineState::Null,
            stalled: false,
            last_seen: None,
            events: Vec::new(),
            pads: Vec::new(),
        }
    }
}

impl CoreState {
    fn flowing(&self) -> bool {
        self.state == PipelineState::Playing && !self.stalled
    }

    fn stall(&mut self, now: Instant) {
        if self.flowing() {
            self.last_seen = Some(now);
        }
        self.stalled = true;
    }

    fn enter(&mut self, target: PipelineState, now: Instant) {
        if self.flowing() && target != PipelineState::Playing {
            self.last_seen = Some(now);
        }
        self.state = target;
    }
}

/// A simulated pipeline.
pub struct FakePipeline {
    core: Arc<PipelineCore>,
    control: FakeControl,
}

#[async_trait]
impl MediaPipeline for FakePipeline {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn state(&self) -> PipelineState {
        self.core.lock().state
    }

    async fn set_state(&self, target: PipelineState, timeout: Duration) -> ScenemixResult<()> {
        if target == PipelineState::Null {
            self.core.lock().enter(target, Instant::now());
            return Ok(());
        }

        let (delay, hang, fail) = {
            let mut control = self.control.lock();
            let hang = take_fault(&mut control.hang_transitions, &self.core.name);
            let fail = target == PipelineState::Playing
                && !hang
                && take_fault(&mut control.fail_transitions, &self.core.name);
            (control.transition_delay, hang, fail)
        };

        if fail {
            let event = BusEvent::error(&self.core.name, "device busy or absent");
            self.core.lock().events.push(event);
            return Err(ScenemixError::bus(
                &self.core.name,
                format!("state change to {target} failed"),
            ));
        }
        if hang || delay >= timeout {
            tokio::time::sleep(timeout).await;
            return Err(ScenemixError::transition_timeout(&self.core.name, target, timeout));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.core.lock().enter(target, Instant::now());
        Ok(())
    }

    async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
        let flowing = self.core.lock().flowing();
        if !flowing {
            tokio::time::sleep(timeout).await;
            return Err(ScenemixError::transition_timeout(&self.core.name, "EOS", timeout));
        }
        let mut state = self.core.lock();
        state.stall(Instant::now());
        state.events.push(BusEvent::eos());
        Ok(())
    }

    fn set_pad(&self, element: &str, pad: &str, props: &PadProperties) -> ScenemixResult<()> {
        let known_pad = self
            .core
            .graph
            .chains()
            .iter()
            .filter_map(|chain| chain.target())
            .any(|target| target.element == element && target.pad == pad);
        if !known_pad {
            return Err(ScenemixError::not_found("pad", format!("{element}.{pad}")));
        }
        self.core
            .lock()
            .pads
            .push((element.to_string(), pad.to_string(), *props));
        Ok(())
    }

    fn take_bus_events(&self) -> Vec<BusEvent> {
        std::mem::take(&mut self.core.lock().events)
    }

    fn last_activity(&self) -> Option<Instant> {
        let state = self.core.lock();
        if state.flowing() {
            Some(Instant::now())
        } else {
            state.last_seen
        }
    }
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.core.lock().enter(PipelineState::Null, Instant::now());
    }
}
