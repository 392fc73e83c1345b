//! GStreamer implementation of the pipeline contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use gst::prelude::*;
use gstreamer as gst;
use scenemix_common::clock::ActivityStamp;
use scenemix_common::error::{ScenemixError, ScenemixResult};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::{BusEvent, MediaPipeline, PadProperties, PipelineBackend, PipelineState};
use crate::graph::{PipelineGraph, ACTIVITY_TAP};

/// Builds real GStreamer pipelines via `gst::parse::launch`.
#[derive(Debug, Default, Clone)]
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> ScenemixResult<Self> {
        init_gstreamer()?;
        Ok(Self)
    }
}

impl PipelineBackend for GstBackend {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn build(&self, graph: &PipelineGraph) -> ScenemixResult<Arc<dyn MediaPipeline>> {
        init_gstreamer()?;
        let launch = graph.compile()?;
        tracing::debug!(pipeline = graph.name(), %launch, "Building pipeline");
        Ok(Arc::new(GstMediaPipeline::from_launch(graph.name(), &launch)?))
    }
}

pub struct GstMediaPipeline {
    name: String,
    pipeline: gst::Pipeline,
    events: Arc<Mutex<Vec<BusEvent>>>,
    eos_seen: Arc<AtomicBool>,
    eos_notify: Arc<Notify>,
    activity: Arc<ActivityStamp>,
}

impl GstMediaPipeline {
    pub fn from_launch(name: impl Into<String>, launch: &str) -> ScenemixResult<Self> {
        let name = name.into();

        let element = gst::parse::launch(launch).map_err(|e| {
            ScenemixError::pipeline_build(format!("Failed to build {name} pipeline: {e}"))
        })?;

        let pipeline = element.dynamic_cast::<gst::Pipeline>().map_err(|_| {
            ScenemixError::pipeline_build("Launch string did not produce a pipeline")
        })?;

        let events = Arc::new(Mutex::new(Vec::new()));
        let eos_seen = Arc::new(AtomicBool::new(false));
        let eos_notify = Arc::new(Notify::new());
        let activity = Arc::new(ActivityStamp::new());

        let bus = pipeline
            .bus()
            .ok_or_else(|| ScenemixError::pipeline_build("Pipeline has no bus"))?;
        {
            let events = Arc::clone(&events);
            let eos_seen = Arc::clone(&eos_seen);
            let eos_notify = Arc::clone(&eos_notify);
            bus.set_sync_handler(move |_bus, msg| {
                let event = match msg.view() {
                    gst::MessageView::Error(err) => Some(BusEvent {
                        debug: err.debug().map(|d| d.to_string()),
                        ..BusEvent::error(message_source(msg), err.error().to_string())
                    }),
                    gst::MessageView::Warning(warn) => Some(BusEvent {
                        debug: warn.debug().map(|d| d.to_string()),
                        ..BusEvent::warning(message_source(msg), warn.error().to_string())
                    }),
                    gst::MessageView::Eos(_) => {
                        eos_seen.store(true, Ordering::SeqCst);
                        eos_notify.notify_waiters();
                        Some(BusEvent::eos())
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    events
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(event);
                }
                gst::BusSyncReply::Drop
            });
        }

        match pipeline
            .by_name(ACTIVITY_TAP)
            .and_then(|tap| tap.static_pad("src"))
        {
            Some(pad) => {
                let stamp = Arc::clone(&activity);
                pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, _info| {
                    stamp.touch();
                    gst::PadProbeReturn::Ok
                });
            }
            None => {
                tracing::warn!(pipeline = %name, "No activity tap; liveness will read as stale");
            }
        }

        Ok(Self {
            name,
            pipeline,
            events,
            eos_seen,
            eos_notify,
            activity,
        })
    }
}

#[async_trait]
impl MediaPipeline for GstMediaPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> PipelineState {
        from_gst_state(self.pipeline.current_state())
    }

    async fn set_state(&self, target: PipelineState, timeout: Duration) -> ScenemixResult<()> {
        let pipeline = self.pipeline.clone();
        let gst_target = to_gst_state(target);
        let wait = gst::ClockTime::from_nseconds(timeout.as_nanos() as u64);

        // Both the request and the wait may block on streaming threads.
        let task = tokio::task::spawn_blocking(move || {
            let requested = pipeline.set_state(gst_target);
            let (result, current, _pending) = pipeline.state(wait);
            (requested.is_ok() && result.is_ok(), current)
        });

        // The blocking wait is bounded by `wait`; the outer bound covers a
        // streaming thread that never yields the state lock.
        let outcome = tokio::time::timeout(timeout + Duration::from_millis(250), task).await;
        match outcome {
            Ok(Ok((true, current))) if current == gst_target => Ok(()),
            Ok(Ok((false, current))) => {
                tracing::warn!(pipeline = %self.name, %target, ?current, "State change failed");
                Err(ScenemixError::bus(
                    &self.name,
                    format!("state change to {target} failed"),
                ))
            }
            Ok(Ok((true, current))) => {
                tracing::warn!(
                    pipeline = %self.name,
                    %target,
                    ?current,
                    "Pipeline did not reach target state within timeout"
                );
                Err(ScenemixError::transition_timeout(&self.name, target, timeout))
            }
            Ok(Err(join)) => Err(ScenemixError::Other(anyhow::anyhow!(
                "state change task for {} failed: {join}",
                self.name
            ))),
            Err(_) => Err(ScenemixError::transition_timeout(&self.name, target, timeout)),
        }
    }

    async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
        self.eos_seen.store(false, Ordering::SeqCst);
        let notified = self.eos_notify.notified();

        if !self.pipeline.send_event(gst::event::Eos::new()) {
            tracing::warn!(pipeline = %self.name, "Failed to send EOS event");
            return Err(ScenemixError::bus(&self.name, "EOS event refused"));
        }
        if self.eos_seen.load(Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::time::timeout(timeout, notified).await {
            Ok(()) => {
                tracing::debug!(pipeline = %self.name, "EOS received; pipeline drained");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(pipeline = %self.name, ?timeout, "EOS drain timed out");
                Err(ScenemixError::transition_timeout(&self.name, "EOS", timeout))
            }
        }
    }

    fn set_pad(&self, element: &str, pad: &str, props: &PadProperties) -> ScenemixResult<()> {
        let target = self
            .pipeline
            .by_name(element)
            .ok_or_else(|| ScenemixError::not_found("element", element))?;
        let pad = target
            .static_pad(pad)
            .ok_or_else(|| ScenemixError::not_found("pad", format!("{element}.{pad}")))?;

        pad.set_property("xpos", props.xpos);
        pad.set_property("ypos", props.ypos);
        pad.set_property("width", props.width);
        pad.set_property("height", props.height);
        pad.set_property("zorder", props.zorder);
        pad.set_property("alpha", props.alpha);
        Ok(())
    }

    fn take_bus_events(&self) -> Vec<BusEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn last_activity(&self) -> Option<Instant> {
        self.activity.last()
    }
}

impl Drop for GstMediaPipeline {
    fn drop(&mut self) {
        if self.pipeline.set_state(gst::State::Null).is_err() {
            tracing::warn!(pipeline = %self.name, "Failed to release pipeline on drop");
        }
    }
}

fn message_source(msg: &gst::Message) -> String {
    msg.src()
        .map(|src| src.path_string().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_gst_state(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

fn from_gst_state(state: gst::State) -> PipelineState {
    match state {
        gst::State::Playing => PipelineState::Playing,
        gst::State::Paused => PipelineState::Paused,
        gst::State::Ready => PipelineState::Ready,
        _ => PipelineState::Null,
    }
}

fn init_gstreamer() -> ScenemixResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(ScenemixError::pipeline_build(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_is_symmetric() {
        for state in [
            PipelineState::Null,
            PipelineState::Ready,
            PipelineState::Paused,
            PipelineState::Playing,
        ] {
            assert_eq!(from_gst_state(to_gst_state(state)), state);
        }
        assert_eq!(from_gst_state(gst::State::VoidPending), PipelineState::Null);
    }
}
