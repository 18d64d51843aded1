//! Multi-exposure batches run against the selected camera
//!
//! A batch is a background task that repeats count times: start an exposure
//! on the remote camera, wait for CCD_EXPOSURE to leave Busy, then sleep for
//! the configured delay. Abort cancels the task through its token.

use axon_core::standard::{self, CCD_EXPOSURE};
use axon_core::{Bus, BusError, ClientId, Property, PropertyState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::imager::{
    AgentShared, ExposureStatus, ImagerAgent, ABORT, AGENT_ABORT_PROCESS, AGENT_CCD_BATCH, AGENT_START_PROCESS,
    BATCH_COUNT, BATCH_DELAY, BATCH_EXPOSURE, START_CCD_BATCH,
};

/// Handle to the running batch, held in the agent state
pub(crate) struct BatchRun {
    pub cancel: CancellationToken,
    pub camera: String,
}

#[derive(Clone)]
struct BatchPlan {
    bus: Bus,
    client: Option<ClientId>,
    camera: String,
    count: u32,
    exposure: f64,
    delay: Duration,
    grace: Duration,
}

enum Start {
    Ignored,
    Publish(Property, Option<String>),
    Run(Property, BatchPlan, CancellationToken),
}

impl ImagerAgent {
    pub(crate) fn start_batch(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let start = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let settings = state.props.get(AGENT_CCD_BATCH).cloned();
            let running = state.batch.is_some();
            let selected = state.selected.clone();
            let client = state.client;
            match state.props.get_mut(AGENT_START_PROCESS) {
                None => Start::Ignored,
                Some(_) if running => Start::Ignored,
                Some(start) => {
                    if let Err(e) = start.copy_values(request, false) {
                        warn!(error = %e, "Rejected batch start");
                        start.state = PropertyState::Alert;
                        Start::Publish(start.clone(), Some(e.to_string()))
                    } else if start.switch_value(START_CCD_BATCH) != Some(true) {
                        start.state = PropertyState::Ok;
                        Start::Publish(start.clone(), None)
                    } else if let Some(camera) = selected {
                        let value = |item: &str| settings.as_ref().and_then(|s| s.number_value(item)).unwrap_or(0.0);
                        let plan = BatchPlan {
                            bus: bus.clone(),
                            client,
                            camera: camera.clone(),
                            count: value(BATCH_COUNT).max(0.0) as u32,
                            exposure: value(BATCH_EXPOSURE).max(0.0),
                            delay: Duration::from_secs_f64(value(BATCH_DELAY).max(0.0)),
                            grace: Duration::from_millis(self.shared.config.completion_grace_ms),
                        };
                        let cancel = CancellationToken::new();
                        state.batch = Some(BatchRun {
                            cancel: cancel.clone(),
                            camera,
                        });
                        start.state = PropertyState::Busy;
                        Start::Run(start.clone(), plan, cancel)
                    } else {
                        start.set_switch(START_CCD_BATCH, false);
                        start.state = PropertyState::Alert;
                        Start::Publish(start.clone(), Some("No camera selected".to_string()))
                    }
                }
            }
        };

        match start {
            Start::Ignored => {}
            Start::Publish(snapshot, message) => bus.update_property(&snapshot, message.as_deref()),
            Start::Run(snapshot, plan, cancel) => {
                info!(
                    camera = %plan.camera,
                    count = plan.count,
                    exposure = plan.exposure,
                    "Batch started"
                );
                bus.update_property(&snapshot, None);
                let shared = self.shared.clone();
                self.shared.runtime.spawn(run_batch(shared, plan, cancel));
            }
        }
        Ok(())
    }

    pub(crate) fn abort_batch(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let (abort, stopped, client) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let client = state.client;
            let run = state.batch.take();
            let abort = state.props.get_mut(AGENT_ABORT_PROCESS).map(|abort| {
                // the switch is momentary
                let _ = abort.copy_values(request, false);
                abort.set_switch(ABORT, false);
                abort.state = PropertyState::Ok;
                abort.clone()
            });
            let stopped = run.and_then(|run| {
                run.cancel.cancel();
                state.props.get_mut(AGENT_START_PROCESS).map(|start| {
                    start.set_switch(START_CCD_BATCH, false);
                    start.state = PropertyState::Alert;
                    (start.clone(), run.camera)
                })
            });
            (abort, stopped, client)
        };

        if let Some((start, camera)) = stopped {
            info!(camera = %camera, "Batch aborted");
            if let Err(e) = bus.change_property(client, &standard::abort_exposure_request(&camera)?) {
                warn!(camera = %camera, error = %e, "Failed to abort exposure");
            }
            bus.update_property(&start, Some("Batch aborted"));
        }
        if let Some(abort) = abort {
            bus.update_property(&abort, None);
        }
        Ok(())
    }
}

async fn run_batch(shared: Arc<AgentShared>, plan: BatchPlan, cancel: CancellationToken) {
    let outcome = run_frames(&shared, &plan, &cancel).await;

    let gate = plan.bus.gate(&shared.config.name);
    let _gate = gate.as_ref().map(|g| g.lock());
    let published = {
        let mut state = shared.state.lock();
        if cancel.is_cancelled() {
            return;
        }
        state.batch = None;
        state.props.get_mut(AGENT_START_PROCESS).map(|start| {
            start.set_switch(START_CCD_BATCH, false);
            let message = match &outcome {
                Ok(frames) => {
                    start.state = PropertyState::Ok;
                    format!("Batch finished, {} frames", frames)
                }
                Err(e) => {
                    start.state = PropertyState::Alert;
                    format!("Batch failed: {}", e)
                }
            };
            (start.clone(), message)
        })
    };

    match &outcome {
        Ok(frames) => info!(camera = %plan.camera, frames, "Batch finished"),
        Err(e) => warn!(camera = %plan.camera, error = %e, "Batch failed"),
    }
    if let Some((snapshot, message)) = published {
        plan.bus.update_property(&snapshot, Some(&message));
    }
}

async fn run_frames(shared: &AgentShared, plan: &BatchPlan, cancel: &CancellationToken) -> Result<u32, AgentError> {
    let limit = Duration::from_secs_f64(plan.exposure) + plan.grace;

    for frame in 0..plan.count {
        let mut status = shared.exposure.subscribe();
        let issued_after = status.borrow_and_update().seq;

        let request = standard::exposure_request(&plan.camera, plan.exposure)?;
        plan.bus.change_property(plan.client, &request)?;

        let state = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            finished = tokio::time::timeout(limit, exposure_finished(&mut status, issued_after, &plan.camera)) => {
                finished.map_err(|_| AgentError::Timeout {
                    device: plan.camera.clone(),
                    property: CCD_EXPOSURE.to_string(),
                })?
            }
        };
        if state != PropertyState::Ok {
            return Err(AgentError::Failed {
                device: plan.camera.clone(),
                property: CCD_EXPOSURE.to_string(),
                state,
            });
        }
        debug!(camera = %plan.camera, frame = frame + 1, count = plan.count, "Frame complete");

        if frame + 1 < plan.count && !plan.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(plan.delay) => {}
            }
        }
    }
    Ok(plan.count)
}

/// Wait for a non-Busy exposure state newer than `after`
async fn exposure_finished(
    status: &mut watch::Receiver<ExposureStatus>,
    after: u64,
    camera: &str,
) -> PropertyState {
    loop {
        {
            let current = status.borrow_and_update();
            if current.seq > after && current.device == camera && current.state != PropertyState::Busy {
                return current.state;
            }
        }
        if status.changed().await.is_err() {
            return PropertyState::Alert;
        }
    }
}
