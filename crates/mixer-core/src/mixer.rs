//! Mixer coordinator.
//!
//! One task owns the compositing pipeline. Every control operation is a
//! command on its queue, so pad writes and rebuilds are single-writer and
//! a rebuild is never cancelled by a caller dropping its future. Scene
//! requests that queue up behind a running operation are coalesced: only
//! the newest of a run of consecutive requests is applied.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use scenemix_common::config::MixerSettings;
use scenemix_common::error::{ScenemixError, ScenemixResult};
use scenemix_common::health::{classify, ComponentProbe, ErrorClass, ErrorWindow, HealthStatus, HealthThresholds};
use scenemix_media_graph::backend::{BusSeverity, MediaPipeline, PadProperties, PipelineBackend, PipelineState};
use scenemix_media_graph::relay::MediaRelay;
use scenemix_scene_model::layout::{resolve, PadGeometry, ResolvedSlot};
use scenemix_scene_model::manager::SceneManager;
use scenemix_scene_model::scene::{Resolution, Scene};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::pipeline::{input_of_element, mixer_graph, pad_properties, sink_pad, COMPOSITOR};
use crate::plan::{plan_switch, resolve_inputs, InputSpec, MissingSourcePolicy, SwitchPlan, WiredSet};
use crate::source::SourceDirectory;
use crate::transition::{crossfade_endpoints, frame, ramp_steps, Transition};

/// Health component name of the mixer.
pub const COMPONENT: &str = "mixer";

/// Lifecycle state of the mixer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixerState {
    Null,
    Ready,
    Playing,
    /// Old pipeline torn down, new one on its way to PLAYING.
    Rebuilding,
    /// Last rebuild failed; the pipeline is at NULL.
    Error,
}

impl fmt::Display for MixerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "NULL",
            Self::Ready => "READY",
            Self::Playing => "PLAYING",
            Self::Rebuilding => "REBUILDING",
            Self::Error => "ERROR",
        })
    }
}

/// Best-effort mixer status.
#[derive(Debug, Clone, Serialize)]
pub struct MixerStatus {
    pub state: MixerState,
    pub health: HealthStatus,
    pub active_scene: Option<String>,
    /// Every source with a compositor pad, placeholders included.
    pub wired_sources: Vec<String>,
    /// Sources rendered as black because their camera was not streaming.
    pub placeholders: Vec<String>,
    /// Hidden sources whose branch failed; a scene needing one rebuilds.
    pub detached: Vec<String>,
    pub output: Option<Resolution>,
    pub rebuilds: u64,
    pub last_error: Option<String>,
}

/// How an applied scene reached the program output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    InPlace,
    Rebuilt,
    /// The mixer is stopped; the scene is used on the next start.
    Deferred,
}

/// Result of a scene request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SceneOutcome {
    Applied { scene_id: String, mode: ApplyMode },
    /// A newer request queued behind this one and was applied instead.
    Superseded { scene_id: String, by: String },
}

struct Snapshot {
    state: MixerState,
    /// Operator intent: the mixer should be PLAYING.
    wanted: bool,
    /// A fatal bus error stopped the pipeline.
    failed: bool,
    active_scene: Option<String>,
    wired_sources: Vec<String>,
    placeholders: Vec<String>,
    detached: Vec<String>,
    output: Option<Resolution>,
    rebuilds: u64,
    last_error: Option<String>,
    pipeline: Option<Arc<dyn MediaPipeline>>,
    active_since: Option<Instant>,
    errors: ErrorWindow,
}

struct MixerShared {
    snapshot: RwLock<Snapshot>,
    thresholds: HealthThresholds,
}

impl MixerShared {
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }

    fn probe(&self, now: Instant) -> ComponentProbe {
        let s = self.read();
        let expected = if s.wanted {
            MixerState::Playing
        } else {
            MixerState::Null
        };
        ComponentProbe {
            name: COMPONENT.to_string(),
            reported_state: s.state.to_string(),
            expected_state: expected.to_string(),
            expects_flow: s.wanted,
            fatal: s.failed || s.state == MixerState::Error,
            last_activity: s.pipeline.as_ref().and_then(|p| p.last_activity()),
            active_since: s.active_since,
            recent_errors: s.errors.recent(now),
        }
    }

    fn status(&self) -> MixerStatus {
        let now = Instant::now();
        let health = classify(&self.probe(now), &self.thresholds, now);
        let s = self.read();
        MixerStatus {
            state: s.state,
            health,
            active_scene: s.active_scene.clone(),
            wired_sources: s.wired_sources.clone(),
            placeholders: s.placeholders.clone(),
            detached: s.detached.clone(),
            output: s.output,
            rebuilds: s.rebuilds,
            last_error: s.last_error.clone(),
        }
    }
}

type Reply = oneshot::Sender<ScenemixResult<()>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    SetScene {
        scene_id: String,
        transition: Transition,
        reply: oneshot::Sender<ScenemixResult<SceneOutcome>>,
    },
    Rebuild(Reply),
    Drain(Duration, Reply),
    ForceStop(Reply),
    Shutdown(oneshot::Sender<()>),
}

/// The running pipeline and what it is wired for.
struct ActivePipeline {
    pipeline: Arc<dyn MediaPipeline>,
    inputs: Vec<InputSpec>,
    output: Resolution,
    /// Placements currently written to the compositor.
    slots: Vec<ResolvedSlot>,
    /// Hidden inputs whose branch posted an error. Their pads stay wired
    /// but no longer count as usable.
    detached: Vec<String>,
}

impl ActivePipeline {
    fn wired(&self) -> WiredSet {
        WiredSet {
            sources: self
                .inputs
                .iter()
                .filter(|i| !i.is_placeholder() && !self.detached.contains(&i.source_id))
                .map(|i| i.source_id.clone())
                .collect(),
            output: self.output,
        }
    }

    fn pad_of(&self, source_id: &str) -> Option<String> {
        self.inputs
            .iter()
            .position(|i| i.source_id == source_id)
            .map(sink_pad)
    }

    fn write_pad(&self, source_id: &str, props: &PadProperties) -> ScenemixResult<()> {
        let pad = self
            .pad_of(source_id)
            .ok_or_else(|| ScenemixError::not_found("compositor pad", source_id))?;
        self.pipeline.set_pad(COMPOSITOR, &pad, props)
    }

    fn write_geometry(&self, placements: &[(String, PadGeometry)]) -> ScenemixResult<()> {
        for (source_id, geometry) in placements {
            self.write_pad(source_id, &pad_properties(geometry))?;
        }
        Ok(())
    }

    /// Source whose branch posted from `element`, unless the current
    /// placements show it.
    fn hidden_input(&self, element: &str) -> Option<&str> {
        let index = input_of_element(element, self.inputs.len())?;
        let source_id = self.inputs[index].source_id.as_str();
        let shown = self.slots.iter().any(|slot| slot.source_id == source_id);
        (!shown).then_some(source_id)
    }
}

struct MixerWorker {
    shared: Arc<MixerShared>,
    settings: MixerSettings,
    scenes: SceneManager,
    sources: Arc<dyn SourceDirectory>,
    backend: Arc<dyn PipelineBackend>,
    relay: Arc<dyn MediaRelay>,
    active: Option<ActivePipeline>,
}

impl MixerWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.settings.bus_poll());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(first) = command else { break };
                    let mut batch = VecDeque::from([first]);
                    while let Ok(next) = commands.try_recv() {
                        batch.push_back(next);
                    }
                    if self.handle_batch(batch).await.is_break() {
                        break;
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.teardown(false).await;
        tracing::debug!("Mixer coordinator stopped");
    }

    async fn handle_batch(&mut self, batch: VecDeque<Command>) -> ControlFlow<()> {
        let mut batch = batch.into_iter().peekable();
        while let Some(command) = batch.next() {
            let newer_scene = match batch.peek() {
                Some(Command::SetScene { scene_id, .. }) => Some(scene_id.clone()),
                _ => None,
            };
            if self.handle(command, newer_scene).await.is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// `newer_scene` is the scene request queued right behind `command`.
    async fn handle(&mut self, command: Command, newer_scene: Option<String>) -> ControlFlow<()> {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.shared.update(|s| {
                    s.wanted = false;
                    s.failed = false;
                });
                self.teardown(true).await;
                tracing::info!("Mixer stopped");
                let _ = reply.send(Ok(()));
            }
            Command::SetScene {
                scene_id,
                transition,
                reply,
            } => {
                if let Some(by) = newer_scene {
                    tracing::debug!(scene = %scene_id, superseded_by = %by, "Scene request superseded");
                    let _ = reply.send(Ok(SceneOutcome::Superseded { scene_id, by }));
                    return ControlFlow::Continue(());
                }
                let result = self.set_scene(&scene_id, transition).await;
                if let Err(e) = &result {
                    tracing::warn!(scene = %scene_id, error = %e, "Scene request failed");
                }
                let _ = reply.send(result);
            }
            Command::Rebuild(reply) => {
                let result = self.recover().await;
                let _ = reply.send(result);
            }
            Command::Drain(timeout, reply) => {
                let result = match &self.active {
                    Some(active) => active.pipeline.drain(timeout).await,
                    None => Ok(()),
                };
                if result.is_ok() {
                    self.teardown(false).await;
                }
                let _ = reply.send(result);
            }
            Command::ForceStop(reply) => {
                self.teardown(false).await;
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown(reply) => {
                self.shared.update(|s| s.wanted = false);
                self.teardown(true).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self) -> ScenemixResult<()> {
        self.shared.update(|s| s.wanted = true);
        if self.active.is_some() {
            return Ok(());
        }
        let active_scene = self.shared.read().active_scene.clone();
        let scene = self.choose_scene(active_scene)?;
        tracing::info!(scene = %scene.id, "Starting mixer");
        let inputs = resolve_inputs(&scene, self.sources.as_ref(), MissingSourcePolicy::Placeholder)?;
        self.rebuild(&scene, inputs, Transition::Cut).await
    }

    /// Rebuild from the last-known-good scene, standing in black for any
    /// camera that is not streaming. No-op unless the mixer should run.
    async fn recover(&mut self) -> ScenemixResult<()> {
        if !self.shared.read().wanted {
            tracing::debug!("Mixer rebuild skipped; mixer is stopped");
            return Ok(());
        }
        let preferred = self
            .scenes
            .last_known_good()
            .or_else(|| self.shared.read().active_scene.clone());
        let scene = self.choose_scene(preferred)?;
        tracing::info!(scene = %scene.id, "Rebuilding mixer");
        let inputs = resolve_inputs(&scene, self.sources.as_ref(), MissingSourcePolicy::Placeholder)?;
        self.rebuild(&scene, inputs, Transition::Cut).await
    }

    /// First existing scene of: `preferred`, last known good, configured
    /// default, first in the catalog.
    fn choose_scene(&self, preferred: Option<String>) -> ScenemixResult<Scene> {
        let candidates = [
            preferred,
            self.scenes.last_known_good(),
            self.settings.default_scene.clone(),
        ];
        for id in candidates.into_iter().flatten() {
            if let Ok(scene) = self.scenes.get(&id) {
                return Ok(scene);
            }
        }
        self.scenes
            .list()
            .into_iter()
            .next()
            .ok_or_else(|| ScenemixError::config("scene catalog is empty"))
    }

    async fn set_scene(&mut self, scene_id: &str, transition: Transition) -> ScenemixResult<SceneOutcome> {
        let scene = self.scenes.get(scene_id)?;

        // Ramps run on this task; one longer than a transition timeout
        // would hold every queued command behind it.
        let limit = self.settings.transition_timeout();
        if transition.duration(self.settings.auto_transition()) > limit {
            return Err(ScenemixError::scene_rejected(
                scene.id,
                format!("{transition} is longer than the {limit:?} transition timeout"),
            ));
        }

        if !self.shared.read().wanted {
            self.shared.update(|s| s.active_scene = Some(scene.id.clone()));
            tracing::info!(scene = %scene.id, "Mixer stopped; scene deferred to next start");
            return Ok(SceneOutcome::Applied {
                scene_id: scene.id,
                mode: ApplyMode::Deferred,
            });
        }

        let wired = self.active.as_ref().map(ActivePipeline::wired);
        let plan = plan_switch(wired.as_ref(), &scene.required_sources(), scene.resolution);
        tracing::info!(scene = %scene.id, %transition, %plan, "Applying scene");

        let mode = match plan {
            SwitchPlan::InPlace => {
                self.switch_in_place(&scene, transition).await?;
                ApplyMode::InPlace
            }
            SwitchPlan::Rebuild => {
                let inputs = resolve_inputs(&scene, self.sources.as_ref(), MissingSourcePolicy::Reject)?;
                self.rebuild(&scene, inputs, transition).await?;
                ApplyMode::Rebuilt
            }
        };
        Ok(SceneOutcome::Applied {
            scene_id: scene.id,
            mode,
        })
    }

    async fn switch_in_place(&mut self, scene: &Scene, transition: Transition) -> ScenemixResult<()> {
        let step = self.settings.transition_step();
        let steps = ramp_steps(transition.duration(self.settings.auto_transition()), step);
        let Some(active) = self.active.as_mut() else {
            return Err(ScenemixError::shutdown(COMPONENT));
        };

        let target = resolve(scene, active.output);
        let endpoints = crossfade_endpoints(&active.slots, &target);

        if steps == 0 {
            let placements: Vec<_> = target
                .iter()
                .map(|slot| (slot.source_id.clone(), slot.geometry))
                .collect();
            active.write_geometry(&placements)?;
        } else {
            for i in 1..=steps {
                active.write_geometry(&frame(&endpoints, i as f64 / steps as f64))?;
                if i < steps {
                    tokio::time::sleep(step).await;
                }
            }
        }

        let unused: Vec<String> = active
            .inputs
            .iter()
            .filter(|i| !target.iter().any(|t| t.source_id == i.source_id))
            .map(|i| i.source_id.clone())
            .collect();
        for source_id in &unused {
            active.write_pad(source_id, &PadProperties::hidden())?;
        }

        active.slots = target;
        self.on_scene_live(&scene.id);
        Ok(())
    }

    /// Replace the pipeline with one wired for `inputs` and bring it to
    /// PLAYING within one transition timeout.
    async fn rebuild(&mut self, scene: &Scene, inputs: Vec<InputSpec>, transition: Transition) -> ScenemixResult<()> {
        self.shared.update(|s| {
            s.state = MixerState::Rebuilding;
            s.rebuilds += 1;
        });
        self.teardown(false).await;
        self.shared.update(|s| {
            s.state = MixerState::Rebuilding;
            s.active_since = Some(Instant::now());
        });

        let output = scene.resolution;
        let graph = mixer_graph(&inputs, output, &self.settings, self.relay.as_ref());
        let pipeline = match self.backend.build(&graph) {
            Ok(pipeline) => pipeline,
            Err(e) => return Err(self.on_rebuild_failure(e)),
        };

        let fade = ramp_steps(
            transition.duration(self.settings.auto_transition()),
            self.settings.transition_step(),
        ) > 0;
        let slots = resolve(scene, output);
        let mut active = ActivePipeline {
            pipeline: Arc::clone(&pipeline),
            inputs,
            output,
            slots: Vec::new(),
            detached: Vec::new(),
        };
        let initial: Vec<_> = slots
            .iter()
            .map(|slot| {
                let geometry = if fade {
                    slot.geometry.with_alpha(0.0)
                } else {
                    slot.geometry
                };
                (slot.source_id.clone(), geometry)
            })
            .collect();
        if let Err(e) = active.write_geometry(&initial) {
            return Err(self.on_rebuild_failure(e));
        }

        if let Err(e) = self.bring_to_playing(pipeline.as_ref()).await {
            if let Err(stop_err) = pipeline
                .set_state(PipelineState::Null, self.settings.transition_timeout())
                .await
            {
                tracing::warn!(error = %stop_err, "Failed to release mixer after failed start");
            }
            drop(active);
            drop(pipeline);
            return Err(self.on_rebuild_failure(e));
        }

        active.slots = initial
            .iter()
            .map(|(source_id, geometry)| ResolvedSlot {
                source_id: source_id.clone(),
                geometry: *geometry,
            })
            .collect();
        let wired_sources: Vec<String> = active.inputs.iter().map(|i| i.source_id.clone()).collect();
        let placeholders: Vec<String> = active
            .inputs
            .iter()
            .filter(|i| i.is_placeholder())
            .map(|i| i.source_id.clone())
            .collect();
        if !placeholders.is_empty() {
            tracing::warn!(scene = %scene.id, ?placeholders, "Mixer running with placeholders");
        }
        self.active = Some(active);
        self.shared.update(|s| {
            s.state = MixerState::Playing;
            s.failed = false;
            s.wired_sources = wired_sources;
            s.placeholders = placeholders;
            s.detached.clear();
            s.output = Some(output);
            s.pipeline = Some(pipeline);
            s.last_error = None;
            s.errors.clear_recent();
        });
        tracing::info!(scene = %scene.id, %output, "Mixer playing");

        if fade {
            self.switch_in_place(scene, transition).await?;
        } else {
            self.on_scene_live(&scene.id);
        }
        Ok(())
    }

    async fn bring_to_playing(&self, pipeline: &dyn MediaPipeline) -> ScenemixResult<()> {
        let timeout = self.settings.transition_timeout();
        let deadline = Instant::now() + timeout;
        for target in [PipelineState::Ready, PipelineState::Playing] {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ScenemixError::transition_timeout(pipeline.name(), target, timeout));
            }
            pipeline.set_state(target, remaining).await?;
            if target == PipelineState::Ready {
                self.shared.update(|s| s.state = MixerState::Ready);
            }
        }
        Ok(())
    }

    fn on_rebuild_failure(&mut self, err: ScenemixError) -> ScenemixError {
        self.shared.update(|s| {
            s.state = MixerState::Error;
            s.pipeline = None;
            s.active_since = None;
            s.wired_sources.clear();
            s.placeholders.clear();
            s.detached.clear();
            s.output = None;
            s.last_error = Some(err.to_string());
            s.errors.record(ErrorClass::Fatal);
        });
        tracing::error!(error = %err, "Mixer rebuild failed; pipeline at NULL");
        err
    }

    fn on_scene_live(&self, scene_id: &str) {
        self.shared
            .update(|s| s.active_scene = Some(scene_id.to_string()));
        if let Err(e) = self.scenes.mark_last_known_good(scene_id) {
            tracing::warn!(scene = %scene_id, error = %e, "Failed to record last known good scene");
        }
    }

    /// Stop the pipeline at NULL. With `graceful`, drain first.
    async fn teardown(&mut self, graceful: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        let timeout = self.settings.transition_timeout();
        if graceful {
            if let Err(e) = active.pipeline.drain(timeout).await {
                tracing::warn!(error = %e, "Mixer drain failed; stopping anyway");
            }
        }
        if let Err(e) = active.pipeline.set_state(PipelineState::Null, timeout).await {
            tracing::warn!(error = %e, "Mixer pipeline did not reach NULL");
        }
        self.shared.update(|s| {
            if s.state != MixerState::Rebuilding {
                s.state = MixerState::Null;
            }
            s.pipeline = None;
            s.active_since = None;
            s.wired_sources.clear();
            s.placeholders.clear();
            s.detached.clear();
            s.output = None;
        });
        drop(active);
        tracing::debug!("Mixer torn down");
    }

    async fn on_tick(&mut self) {
        self.poll_bus().await;
        self.upgrade_placeholders().await;
    }

    /// Drain the bus. Errors from a branch the program does not show only
    /// detach that input; anything else stops the pipeline at NULL.
    async fn poll_bus(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let events = active.pipeline.take_bus_events();
        if events.is_empty() {
            return;
        }

        let mut failure = None;
        let mut detach: Vec<String> = Vec::new();
        for event in events {
            match event.severity {
                BusSeverity::Warning => {
                    tracing::debug!(element = %event.element, message = %event.message, "Mixer warning");
                    self.shared.update(|s| s.errors.record(ErrorClass::Warning));
                }
                BusSeverity::Error => {
                    if let Some(source_id) = active.hidden_input(&event.element) {
                        tracing::warn!(
                            source = %source_id,
                            element = %event.element,
                            message = %event.message,
                            "Hidden mixer input failed; program unaffected"
                        );
                        self.shared.update(|s| s.errors.record(ErrorClass::Warning));
                        if !detach.iter().any(|d| d == source_id) {
                            detach.push(source_id.to_string());
                        }
                        continue;
                    }
                    tracing::error!(
                        element = %event.element,
                        message = %event.message,
                        debug = ?event.debug,
                        "Mixer pipeline error"
                    );
                    failure.get_or_insert(ScenemixError::bus(event.element, event.message));
                }
                BusSeverity::Eos => {
                    failure.get_or_insert(ScenemixError::bus(
                        active.pipeline.name(),
                        "unexpected end of stream",
                    ));
                }
            }
        }

        if let Some(err) = failure {
            self.teardown(false).await;
            self.shared.update(|s| {
                s.state = MixerState::Null;
                s.failed = true;
                s.last_error = Some(err.to_string());
                s.errors.record(ErrorClass::Fatal);
            });
            tracing::error!(error = %err, "Mixer stopped by fatal error");
            return;
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };
        for source_id in detach {
            if let Err(e) = active.write_pad(&source_id, &PadProperties::hidden()) {
                tracing::warn!(source = %source_id, error = %e, "Failed to hide detached input");
            }
            if !active.detached.contains(&source_id) {
                active.detached.push(source_id);
            }
        }
        let detached = active.detached.clone();
        self.shared.update(|s| s.detached = detached);
    }

    /// Swap placeholders for real streams once their cameras publish.
    async fn upgrade_placeholders(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let ready: Vec<String> = active
            .inputs
            .iter()
            .filter(|i| i.is_placeholder() && self.sources.available(&i.source_id).is_some())
            .map(|i| i.source_id.clone())
            .collect();
        if ready.is_empty() {
            return;
        }
        let Some(scene_id) = self.shared.read().active_scene.clone() else {
            return;
        };
        let Ok(scene) = self.scenes.get(&scene_id) else {
            return;
        };

        tracing::info!(scene = %scene_id, sources = ?ready, "Sources available; replacing placeholders");
        let result = match resolve_inputs(&scene, self.sources.as_ref(), MissingSourcePolicy::Placeholder) {
            Ok(inputs) => self.rebuild(&scene, inputs, Transition::Cut).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(scene = %scene_id, error = %e, "Placeholder replacement failed");
        }
    }
}

/// Handle to the mixer coordinator.
///
/// Cloning yields another handle to the same mixer.
#[derive(Clone)]
pub struct MixerCore {
    shared: Arc<MixerShared>,
    commands: mpsc::UnboundedSender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MixerCore {
    /// Spawn the coordinator. The mixer stays at NULL until [`MixerCore::start`].
    pub fn spawn(
        settings: MixerSettings,
        scenes: SceneManager,
        sources: Arc<dyn SourceDirectory>,
        backend: Arc<dyn PipelineBackend>,
        relay: Arc<dyn MediaRelay>,
        thresholds: HealthThresholds,
    ) -> Self {
        let shared = Arc::new(MixerShared {
            snapshot: RwLock::new(Snapshot {
                state: MixerState::Null,
                wanted: false,
                failed: false,
                active_scene: None,
                wired_sources: Vec::new(),
                placeholders: Vec::new(),
                detached: Vec::new(),
                output: None,
                rebuilds: 0,
                last_error: None,
                pipeline: None,
                active_since: None,
                errors: ErrorWindow::new(settings.error_window()),
            }),
            thresholds,
        });
        let worker = MixerWorker {
            shared: Arc::clone(&shared),
            settings,
            scenes,
            sources,
            backend,
            relay,
            active: None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(worker.run(rx));
        tracing::info!("Mixer core started");
        Self {
            shared,
            commands: tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Bring the mixer to PLAYING with the active, last-known-good,
    /// default, or first scene. Missing cameras render as black.
    pub async fn start(&self) -> ScenemixResult<()> {
        self.request(Command::Start).await
    }

    /// Drain and stop at NULL.
    pub async fn stop(&self) -> ScenemixResult<()> {
        self.request(Command::Stop).await
    }

    /// Queue a scene change. The request is enqueued before this returns,
    /// so the order of calls is the order of application even if the
    /// returned futures are awaited later.
    ///
    /// A camera the scene needs that is not streaming rejects the request
    /// unless the switch is in place.
    /// A ramp longer than the transition timeout is rejected outright.
    pub fn set_scene(
        &self,
        scene_id: &str,
        transition: Transition,
    ) -> impl Future<Output = ScenemixResult<SceneOutcome>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::SetScene {
                scene_id: scene_id.to_string(),
                transition,
                reply: tx,
            })
            .is_ok();
        async move {
            if !sent {
                return Err(ScenemixError::shutdown(COMPONENT));
            }
            rx.await.map_err(|_| ScenemixError::shutdown(COMPONENT))?
        }
    }

    /// Rebuild from the last-known-good scene (watchdog recovery).
    pub async fn rebuild(&self) -> ScenemixResult<()> {
        self.request(Command::Rebuild).await
    }

    /// Send EOS and wait for it; on success the pipeline is torn down.
    pub async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
        self.request(|reply| Command::Drain(timeout, reply)).await
    }

    /// Tear down without draining. Operator intent is kept.
    pub async fn force_stop(&self) -> ScenemixResult<()> {
        self.request(Command::ForceStop).await
    }

    pub fn status(&self) -> MixerStatus {
        self.shared.status()
    }

    /// Health snapshot for the watchdog.
    pub fn probe(&self) -> ComponentProbe {
        self.shared.probe(Instant::now())
    }

    pub fn rebuild_count(&self) -> u64 {
        self.shared.read().rebuilds
    }

    /// Stop the pipeline and wait for the coordinator to exit.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Mixer coordinator panicked");
            }
        }
        tracing::info!("Mixer core shut down");
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> ScenemixResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ScenemixError::shutdown(COMPONENT))?;
        rx.await.map_err(|_| ScenemixError::shutdown(COMPONENT))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use scenemix_common::config::VideoCodec;
    use scenemix_media_graph::backend::BusEvent;
    use scenemix_media_graph::fake::{FakeBackend, FakeControl};
    use scenemix_media_graph::relay::{RtspRelay, StreamHandle};
    use scenemix_scene_model::scene::{KnownSources, Slot};

    use crate::source::SourceInfo;

    #[derive(Default)]
    struct StaticSources(Mutex<BTreeSet<String>>);

    impl StaticSources {
        fn with(ids: &[&str]) -> Arc<Self> {
            let sources = Self::default();
            for id in ids {
                sources.set(id, true);
            }
            Arc::new(sources)
        }

        fn set(&self, id: &str, available: bool) {
            let mut ids = self.0.lock().unwrap();
            if available {
                ids.insert(id.to_string());
            } else {
                ids.remove(id);
            }
        }
    }

    impl SourceDirectory for StaticSources {
        fn available(&self, source_id: &str) -> Option<SourceInfo> {
            self.0.lock().unwrap().contains(source_id).then(|| SourceInfo {
                handle: StreamHandle::new(source_id),
                codec: VideoCodec::H264,
            })
        }
    }

    fn scenes() -> SceneManager {
        SceneManager::in_memory(
            vec![
                Scene::new("a", "Camera 0", vec![Slot::full("cam0")]),
                Scene::new(
                    "b",
                    "Dual",
                    vec![Slot::new("cam0", 0.0, 0.0, 0.5, 1.0), Slot::new("cam1", 0.5, 0.0, 0.5, 1.0)],
                ),
                Scene::new("c", "Camera 1", vec![Slot::full("cam1")]),
                Scene::new("d", "Camera 2", vec![Slot::full("cam2")]),
                Scene::new("e", "Camera 3", vec![Slot::full("cam3")]),
            ],
            KnownSources::new(["cam0", "cam1", "cam2", "cam3"]),
        )
    }

    fn settings() -> MixerSettings {
        MixerSettings {
            transition_timeout_ms: 2_000,
            default_scene: Some("a".to_string()),
            ..MixerSettings::default()
        }
    }

    fn mixer(sources: Arc<StaticSources>) -> (MixerCore, FakeControl) {
        let backend = FakeBackend::new();
        let control = backend.control();
        let mixer = MixerCore::spawn(
            settings(),
            scenes(),
            sources,
            Arc::new(backend),
            Arc::new(RtspRelay::new("rtsp://127.0.0.1:8554", 200)),
            HealthThresholds::default(),
        );
        (mixer, control)
    }

    #[tokio::test(start_paused = true)]
    async fn start_uses_default_scene() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        mixer.start().await.unwrap();

        let status = mixer.status();
        assert_eq!(status.state, MixerState::Playing);
        assert_eq!(status.health, HealthStatus::Healthy);
        assert_eq!(status.active_scene.as_deref(), Some("a"));
        assert_eq!(status.wired_sources, ["cam0"]);
        assert_eq!(control.build_count("mixer"), 1);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn subset_switch_rewrites_pads_without_rebuilding() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        mixer.set_scene("b", Transition::Cut).await.unwrap();
        mixer.start().await.unwrap();
        assert_eq!(mixer.status().active_scene.as_deref(), Some("b"));
        let writes_before = control.pad_writes("mixer").len();

        let outcome = mixer.set_scene("c", Transition::Cut).await.unwrap();
        assert_eq!(
            outcome,
            SceneOutcome::Applied {
                scene_id: "c".to_string(),
                mode: ApplyMode::InPlace
            }
        );
        assert_eq!(control.build_count("mixer"), 1);

        let writes = control.pad_writes("mixer");
        let new_writes = &writes[writes_before..];
        // cam1 (sink_1) goes full frame, cam0 (sink_0) is hidden.
        assert!(new_writes
            .iter()
            .any(|(_, pad, p)| pad == "sink_1" && p.width == 1920 && p.alpha == 1.0));
        assert!(new_writes
            .iter()
            .any(|(_, pad, p)| pad == "sink_0" && p.alpha == 0.0));
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mix_ramps_alpha_in_steps() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        mixer.set_scene("b", Transition::Cut).await.unwrap();
        mixer.start().await.unwrap();
        let before = control.pad_writes("mixer").len();

        mixer
            .set_scene("c", Transition::mix(Duration::from_millis(200)))
            .await
            .unwrap();

        let writes = control.pad_writes("mixer");
        let cam0_alphas: Vec<f64> = writes[before..]
            .iter()
            .filter(|(_, pad, _)| pad == "sink_0")
            .map(|(_, _, p)| p.alpha)
            .collect();
        // 200ms at 40ms steps: five frames, then the final hide.
        assert_eq!(cam0_alphas.len(), 6);
        assert!(cam0_alphas.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*cam0_alphas.last().unwrap(), 0.0);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn mix_longer_than_the_transition_timeout_is_refused() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        mixer.set_scene("b", Transition::Cut).await.unwrap();
        mixer.start().await.unwrap();
        let before = control.pad_writes("mixer").len();

        let err = mixer
            .set_scene("c", Transition::mix(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScenemixError::SceneRejected { .. }));
        assert_eq!(control.pad_writes("mixer").len(), before);
        assert_eq!(mixer.status().active_scene.as_deref(), Some("b"));

        // The longest accepted ramp still lets a queued stop through.
        let began = Instant::now();
        let mix = tokio::spawn(mixer.set_scene("c", Transition::mix(settings().transition_timeout())));
        tokio::time::sleep(Duration::from_millis(10)).await;
        mixer.stop().await.unwrap();
        assert!(began.elapsed() <= settings().transition_timeout() * 2);
        assert!(matches!(
            mix.await.unwrap().unwrap(),
            SceneOutcome::Applied { mode: ApplyMode::InPlace, .. }
        ));
        assert_eq!(mixer.status().state, MixerState::Null);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cut_to_new_sources_is_one_bounded_rebuild() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        control.set_transition_delay(Duration::from_millis(300));
        mixer.start().await.unwrap();
        assert_eq!(control.build_count("mixer"), 1);

        let began = Instant::now();
        let outcome = mixer.set_scene("b", Transition::Cut).await.unwrap();
        assert_eq!(
            outcome,
            SceneOutcome::Applied {
                scene_id: "b".to_string(),
                mode: ApplyMode::Rebuilt
            }
        );
        assert!(began.elapsed() <= settings().transition_timeout());
        assert_eq!(control.build_count("mixer"), 2);
        assert_eq!(mixer.status().wired_sources, ["cam0", "cam1"]);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_coalesce_to_the_newest() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1", "cam2", "cam3"]));
        control.set_transition_delay(Duration::from_millis(500));
        mixer.start().await.unwrap();

        let first = tokio::spawn(mixer.set_scene("d", Transition::Cut));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = [
            mixer.set_scene("b", Transition::Cut),
            mixer.set_scene("c", Transition::Cut),
        ];
        let last = mixer.set_scene("e", Transition::Cut);

        assert!(matches!(
            first.await.unwrap().unwrap(),
            SceneOutcome::Applied { mode: ApplyMode::Rebuilt, .. }
        ));
        for request in queued {
            assert!(matches!(
                request.await.unwrap(),
                SceneOutcome::Superseded { ref by, .. } if by == "c" || by == "e"
            ));
        }
        assert!(matches!(last.await.unwrap(), SceneOutcome::Applied { .. }));
        // Initial build, "d", then "e" only.
        assert_eq!(control.build_count("mixer"), 3);
        assert_eq!(mixer.status().active_scene.as_deref(), Some("e"));
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transition_timeout_leaves_error_at_null() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0"]));
        control.hang_transitions("mixer", 1);

        let err = mixer.start().await.unwrap_err();
        assert!(matches!(err, ScenemixError::StateTransitionTimeout { .. }));
        let status = mixer.status();
        assert_eq!(status.state, MixerState::Error);
        assert_eq!(status.health, HealthStatus::Failed);
        assert!(control
            .live_pipelines()
            .iter()
            .all(|(_, state)| *state == PipelineState::Null));

        // The watchdog path brings it back.
        mixer.rebuild().await.unwrap();
        assert_eq!(mixer.status().state, MixerState::Playing);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_bus_error_stops_at_null_with_failed_health() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0"]));
        mixer.start().await.unwrap();

        control.inject_bus_event("mixer", BusEvent::error("comp", "internal data stream error"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = mixer.status();
        assert_eq!(status.state, MixerState::Null);
        assert_eq!(status.health, HealthStatus::Failed);
        assert!(status.last_error.unwrap().contains("internal data stream error"));
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn error_from_a_hidden_input_detaches_it_and_keeps_playing() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0", "cam1"]));
        mixer.set_scene("b", Transition::Cut).await.unwrap();
        mixer.start().await.unwrap();
        mixer.set_scene("c", Transition::Cut).await.unwrap();

        // cam0 is still wired on sink_0 but hidden.
        control.post_bus_event("mixer", BusEvent::error("in0_src", "Could not read from resource"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = mixer.status();
        assert_eq!(status.state, MixerState::Playing);
        assert_eq!(status.health, HealthStatus::Degraded);
        assert_eq!(status.detached, ["cam0"]);
        assert!(status.last_error.is_none());
        assert_eq!(control.build_count("mixer"), 1);

        // Showing cam0 again needs a fresh branch.
        let outcome = mixer.set_scene("a", Transition::Cut).await.unwrap();
        assert!(matches!(outcome, SceneOutcome::Applied { mode: ApplyMode::Rebuilt, .. }));
        assert_eq!(control.build_count("mixer"), 2);
        assert!(mixer.status().detached.is_empty());

        // The same error from the shown input stops the program.
        control.inject_bus_event("mixer", BusEvent::error("in0_src", "Could not read from resource"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = mixer.status();
        assert_eq!(status.state, MixerState::Null);
        assert_eq!(status.health, HealthStatus::Failed);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_camera_rejects_operator_scene_but_not_start() {
        let sources = StaticSources::with(&["cam0"]);
        let (mixer, control) = mixer(Arc::clone(&sources));
        mixer.start().await.unwrap();

        let err = mixer.set_scene("b", Transition::Cut).await.unwrap_err();
        assert!(matches!(err, ScenemixError::DeviceUnavailable { .. }));
        assert_eq!(mixer.status().active_scene.as_deref(), Some("a"));
        assert_eq!(control.build_count("mixer"), 1);

        // Recovery tolerates the gap with a placeholder, then upgrades.
        mixer.stop().await.unwrap();
        mixer.set_scene("b", Transition::Cut).await.unwrap();
        mixer.start().await.unwrap();
        assert_eq!(mixer.status().placeholders, ["cam1"]);

        sources.set("cam1", true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = mixer.status();
        assert!(status.placeholders.is_empty());
        assert_eq!(status.state, MixerState::Playing);
        mixer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_mixer_is_healthy_and_rebuild_is_a_no_op() {
        let (mixer, control) = mixer(StaticSources::with(&["cam0"]));
        mixer.rebuild().await.unwrap();
        assert_eq!(control.build_count("mixer"), 0);
        assert_eq!(mixer.status().health, HealthStatus::Healthy);
        mixer.shutdown().await;
    }
}
