use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge::ResponseBridge;
use crate::browser::{Browser, BrowserConfig};
use crate::capture::{capture, CaptureScope};
use crate::cua::{
    ActionRequest, ComputerCallOutput, CuaClient, CuaError, ModelResponse, OpeningTurn, ResponseId,
};
use crate::executor::{execute, Execution, ExecutorConfig};
use crate::trace::{TraceFrame, TraceRecorder};

// ========================= Core Types =========================

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("computer error: {0}")]
    Computer(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("model service error: {message}")]
    Model { message: String, retryable: bool },
    #[error("invalid input: {0}")]
    Input(String),
    #[error("trace error: {0}")]
    Trace(String),
    #[error("other error: {0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    Load,
}

impl LoadState {
    /// Whether a `document.readyState` value means this state has been reached.
    pub fn reached(self, ready_state: &str) -> bool {
        match self {
            LoadState::DomContentLoaded => matches!(ready_state, "interactive" | "complete"),
            LoadState::Load => ready_state == "complete",
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LoadState::DomContentLoaded => "domcontentloaded",
            LoadState::Load => "load",
        })
    }
}

/// What to do when one model turn carries more than one computer call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSelection {
    /// Act on the first call, drop the rest.
    First,
    /// Treat several calls in one turn as bad input and stop.
    Strict,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunStatus {
    /// The model stopped issuing actions.
    Completed,
    IterationCap,
    /// An automation failure ended the loop early.
    Aborted,
    /// The operator typed the exit sentinel.
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RunMetrics {
    pub iterations: usize,
    pub actions: usize,
    pub time_ms: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StepLog {
    pub iteration: usize,
    pub call_id: String,
    pub action: String,
    pub outcome: String,
    pub response_id: Option<String>,
    pub error: Option<String>,
    pub timestamp_ms: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: Option<String>,
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub steps: Vec<StepLog>,
    pub final_message: Option<String>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn cancelled(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task: None,
            status: RunStatus::Cancelled,
            metrics: RunMetrics::default(),
            steps: Vec::new(),
            final_message: None,
            error: None,
        }
    }

    pub fn from_loop(run_id: impl Into<String>, task: &str, report: LoopReport, started: Instant) -> Self {
        let (status, error) = match report.stop {
            StopReason::NoPendingActions => (RunStatus::Completed, None),
            StopReason::IterationCap => (RunStatus::IterationCap, None),
            StopReason::Failed(e) => (RunStatus::Aborted, Some(e.to_string())),
        };
        Self {
            run_id: run_id.into(),
            task: Some(task.to_string()),
            status,
            metrics: RunMetrics {
                iterations: report.iterations,
                actions: report.actions,
                time_ms: started.elapsed().as_millis(),
            },
            steps: report.steps,
            final_message: report.last_response.last_message().map(str::to_string),
            error,
        }
    }
}

// ========================= Pluggable Subsystems =========================

/// The browser as the loop sees it: one page, driven one primitive at a time.
#[async_trait]
pub trait Computer: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AgentError>;
    async fn click(&self, x: i64, y: i64) -> Result<(), AgentError>;
    async fn type_text(&self, text: &str, per_char_delay: Duration) -> Result<(), AgentError>;
    /// Returns `AgentError::Timeout` when the state is not reached in time.
    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<(), AgentError>;
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, AgentError>;
    async fn start_tracing(&self, run_id: &str) -> Result<(), AgentError>;
    /// Writes the bundle to `path`, or discards it when `path` is `None`.
    async fn stop_tracing(&self, path: Option<&Path>) -> Result<(), AgentError>;
    async fn close(&self) -> Result<(), AgentError>;
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn open(&self, turn: &OpeningTurn) -> Result<ModelResponse, AgentError>;
    async fn continue_turn(
        &self,
        previous: &ResponseId,
        output: &ComputerCallOutput,
    ) -> Result<ModelResponse, AgentError>;
}

// ========================= Agent Loop =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub iterations: usize,
    pub display: (u32, u32),
    pub click_settle_timeout: Duration,
    pub type_delay: Duration,
    pub selection: ActionSelection,
}

impl AgentConfig {
    fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            display: self.display,
            click_settle_timeout: self.click_settle_timeout,
            type_delay: self.type_delay,
        }
    }
}

#[derive(Debug)]
pub enum StopReason {
    NoPendingActions,
    IterationCap,
    /// Automation failure or bad input; the run ends but is not an error.
    Failed(AgentError),
}

#[derive(Debug)]
pub struct LoopReport {
    pub iterations: usize,
    pub actions: usize,
    pub stop: StopReason,
    pub steps: Vec<StepLog>,
    pub last_response: ModelResponse,
}

/// Owns the bounded act → capture → report cycle for one run.
pub struct Agent<'a, C: ?Sized, M> {
    computer: &'a C,
    bridge: &'a ResponseBridge<M>,
    cfg: AgentConfig,
}

impl<'a, C, M> Agent<'a, C, M>
where
    C: Computer + ?Sized,
    M: ModelService,
{
    pub fn new(computer: &'a C, bridge: &'a ResponseBridge<M>, cfg: AgentConfig) -> Self {
        Self { computer, bridge, cfg }
    }

    /// Runs until the model stops asking for actions, the iteration cap is hit,
    /// or an action fails. Only model-service failures come back as `Err`.
    pub async fn run(&self, initial: ModelResponse) -> Result<LoopReport, AgentError> {
        let started = Instant::now();
        let exec_cfg = self.cfg.executor();
        let mut response = initial;
        let mut steps: Vec<StepLog> = Vec::new();
        let mut actions = 0usize;

        for iteration in 1..=self.cfg.iterations {
            let request = match self.select(&response) {
                Ok(Some(r)) => r,
                Ok(None) => {
                    info!("No more calls to process (after iteration {}).", iteration - 1);
                    return Ok(self.report(iteration - 1, actions, StopReason::NoPendingActions, steps, response));
                }
                Err(e) => {
                    warn!(iteration, "{}", e);
                    return Ok(self.report(iteration - 1, actions, StopReason::Failed(e), steps, response));
                }
            };

            info!(iteration, call_id = %request.call_id, action = %request.action, "processing computer call");
            let mut step = StepLog {
                iteration,
                call_id: request.call_id.clone(),
                action: request.action.to_string(),
                timestamp_ms: started.elapsed().as_millis(),
                ..Default::default()
            };

            let acted = execute(self.computer, &request.action, &exec_cfg).await;
            let shot = match acted {
                Ok(execution) => {
                    if execution != Execution::Unsupported {
                        actions += 1;
                    }
                    step.outcome = execution.as_str().into();
                    capture(self.computer, CaptureScope::Viewport).await
                }
                Err(e) => Err(e),
            };
            let shot = match shot {
                Ok(s) => s,
                Err(e) => {
                    warn!(iteration, "step failed: {}", e);
                    step.outcome = "error".into();
                    step.error = Some(e.to_string());
                    steps.push(step);
                    return Ok(self.report(iteration, actions, StopReason::Failed(e), steps, response));
                }
            };

            info!(iteration, "feeding screenshot back to model");
            let next = self.bridge.advance(&response, &request, shot).await?;
            step.response_id = Some(next.id.0.clone());
            steps.push(step);
            response = next;
        }

        let stop = if response.pending_actions().next().is_some() {
            info!(cap = self.cfg.iterations, "iteration cap reached");
            StopReason::IterationCap
        } else {
            StopReason::NoPendingActions
        };
        Ok(self.report(self.cfg.iterations, actions, stop, steps, response))
    }

    fn select(&self, response: &ModelResponse) -> Result<Option<ActionRequest>, AgentError> {
        let mut pending = response.pending_actions();
        let Some(first) = pending.next() else {
            return Ok(None);
        };
        let dropped = pending.count();
        if dropped > 0 {
            match self.cfg.selection {
                ActionSelection::First => {
                    warn!(response_id = %response.id, dropped, "model returned several computer calls, acting on the first");
                }
                ActionSelection::Strict => {
                    return Err(AgentError::Input(format!(
                        "response {} carried {} computer calls",
                        response.id,
                        dropped + 1
                    )));
                }
            }
        }
        Ok(Some(first.clone()))
    }

    fn report(
        &self,
        iterations: usize,
        actions: usize,
        stop: StopReason,
        steps: Vec<StepLog>,
        last_response: ModelResponse,
    ) -> LoopReport {
        for summary in last_response.reasoning_summaries() {
            info!("model reasoning: {}", summary);
        }
        if let Some(text) = last_response.last_message() {
            info!("model message: {}", text.trim());
        }
        LoopReport { iterations, actions, stop, steps, last_response }
    }
}

// ========================= Chromium Adapter =========================

pub struct ChromiumComputer {
    browser: Browser,
    trace: Mutex<Option<TraceRecorder>>,
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self, AgentError> {
        info!(headless = cfg.headless, width = cfg.width, height = cfg.height, "launching chromium");
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| AgentError::Computer(format!("{:#}", e)))?;
        Ok(Self { browser, trace: Mutex::new(None) })
    }

    async fn mark(&self, label: String) {
        if let Some(recorder) = self.trace.lock().await.as_mut() {
            recorder.mark(label);
        }
    }

    /// Keeps a capture the run already took as a trace frame. Never captures by itself.
    async fn record(&self, png: &[u8]) {
        let mut guard = self.trace.lock().await;
        let Some(recorder) = guard.as_mut() else {
            return;
        };
        let url = self.browser.url().await.ok().flatten();
        let dom = self.browser.content().await.ok();
        let label = recorder.take_label();
        recorder.push(TraceFrame::new(label, url, png.to_vec(), dom));
    }
}

fn computer_err(e: anyhow::Error) -> AgentError {
    AgentError::Computer(format!("{:#}", e))
}

#[async_trait]
impl Computer for ChromiumComputer {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        info!(%url, "navigating");
        self.browser.goto(url).await.map_err(computer_err)?;
        self.mark(format!("navigate {url}")).await;
        Ok(())
    }

    async fn click(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.browser.click(x, y).await.map_err(computer_err)?;
        self.mark(format!("click {x},{y}")).await;
        Ok(())
    }

    async fn type_text(&self, text: &str, per_char_delay: Duration) -> Result<(), AgentError> {
        self.browser
            .type_text(text, per_char_delay)
            .await
            .map_err(computer_err)?;
        self.mark(format!("type {text:?}")).await;
        Ok(())
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<(), AgentError> {
        let reached = self
            .browser
            .wait_for_load_state(state, timeout)
            .await
            .map_err(computer_err)?;
        if reached {
            Ok(())
        } else {
            Err(AgentError::Timeout(format!(
                "page did not reach {} within {}ms",
                state,
                timeout.as_millis()
            )))
        }
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, AgentError> {
        let png = self.browser.screenshot(full_page).await.map_err(computer_err)?;
        self.record(&png).await;
        Ok(png)
    }

    async fn start_tracing(&self, run_id: &str) -> Result<(), AgentError> {
        info!("starting trace (screenshots + snapshots)");
        *self.trace.lock().await = Some(TraceRecorder::new(run_id));
        Ok(())
    }

    async fn stop_tracing(&self, path: Option<&Path>) -> Result<(), AgentError> {
        let Some(recorder) = self.trace.lock().await.take() else {
            return Ok(());
        };
        match path {
            Some(path) => {
                info!(path = %path.display(), "stopping trace");
                recorder.write(path).await.map(|_| ())
            }
            None => {
                info!(frames = recorder.len(), "discarding trace");
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.browser.close().await.map_err(computer_err)
    }
}

// ========================= CUA-backed Model Service =========================

impl From<CuaError> for AgentError {
    fn from(e: CuaError) -> Self {
        AgentError::Model { retryable: e.is_retryable(), message: e.to_string() }
    }
}

#[async_trait]
impl ModelService for CuaClient {
    async fn open(&self, turn: &OpeningTurn) -> Result<ModelResponse, AgentError> {
        Ok(CuaClient::open(self, turn).await?)
    }

    async fn continue_turn(
        &self,
        previous: &ResponseId,
        output: &ComputerCallOutput,
    ) -> Result<ModelResponse, AgentError> {
        Ok(self.send_computer_output(previous, output).await?)
    }
}

pub fn new_run_id() -> String {
    nanoid!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_state_thresholds() {
        assert!(!LoadState::DomContentLoaded.reached("loading"));
        assert!(LoadState::DomContentLoaded.reached("interactive"));
        assert!(LoadState::DomContentLoaded.reached("complete"));
        assert!(!LoadState::Load.reached("interactive"));
        assert!(LoadState::Load.reached("complete"));
        assert_eq!(LoadState::DomContentLoaded.to_string(), "domcontentloaded");
    }

    #[test]
    fn cua_errors_keep_retry_class() {
        let e: AgentError = CuaError::Decode("bad".into()).into();
        assert!(matches!(e, AgentError::Model { retryable: false, .. }));
    }
}
