//! Run bootstrap: opens the page, asks the operator for a task, seeds the
//! model, hands off to the agent loop and always tears the browser down.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::agent::{new_run_id, Agent, AgentError, Computer, ModelService, RunReport, RunStatus};
use crate::bridge::ResponseBridge;
use crate::capture::{capture, CaptureScope};
use crate::config::PilotConfig;

pub const EXIT_SENTINEL: &str = "exit";

/// The operator's goal for this run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task(String);

impl Task {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskInput {
    Task(Task),
    Exit,
}

impl TaskInput {
    pub fn parse(line: &str) -> Result<Self, AgentError> {
        let line = line.trim();
        if line.eq_ignore_ascii_case(EXIT_SENTINEL) {
            return Ok(TaskInput::Exit);
        }
        if line.is_empty() {
            return Err(AgentError::Input("task must not be empty".into()));
        }
        Ok(TaskInput::Task(Task(line.to_string())))
    }
}

#[async_trait]
pub trait TaskSource: Send {
    async fn read_task(&mut self) -> Result<TaskInput, AgentError>;
}

/// Prompts on stdout and reads one line from stdin.
pub struct StdinPrompt;

#[async_trait]
impl TaskSource for StdinPrompt {
    async fn read_task(&mut self) -> Result<TaskInput, AgentError> {
        let mut out = tokio::io::stdout();
        let stdout_err = |e: std::io::Error| AgentError::Other(format!("stdout: {}", e));
        out.write_all(b"Enter a task (or 'exit'): ").await.map_err(stdout_err)?;
        out.flush().await.map_err(stdout_err)?;
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Other(format!("stdin: {}", e)))?;
        if read == 0 {
            // closed stdin reads as a request to leave
            return Ok(TaskInput::Exit);
        }
        TaskInput::parse(&line)
    }
}

/// A task known up front, e.g. from the environment.
pub struct FixedTask(pub String);

#[async_trait]
impl TaskSource for FixedTask {
    async fn read_task(&mut self) -> Result<TaskInput, AgentError> {
        TaskInput::parse(&self.0)
    }
}

/// Browser handles for one run. Closed exactly once by [`Session::close`].
pub struct Session<C: Computer> {
    computer: C,
    trace_path: Option<PathBuf>,
    tracing: bool,
}

impl<C: Computer> Session<C> {
    pub fn new(computer: C, trace_path: Option<PathBuf>) -> Self {
        Self { computer, trace_path, tracing: false }
    }

    pub fn computer(&self) -> &C {
        &self.computer
    }

    async fn begin(&mut self, run_id: &str, start_url: &str) -> Result<(), AgentError> {
        if self.trace_path.is_some() {
            self.computer.start_tracing(run_id).await?;
            self.tracing = true;
        }
        info!("Navigating to {}", start_url);
        self.computer.navigate(start_url).await
    }

    /// Flushes or drops the trace, then closes the browser. Trace problems are
    /// logged; the browser is closed regardless.
    pub async fn close(self, keep_trace: bool) -> Result<(), AgentError> {
        if self.tracing {
            let path = if keep_trace { self.trace_path.as_deref() } else { None };
            if let Err(e) = self.computer.stop_tracing(path).await {
                error!("failed to save trace: {}", e);
            }
        }
        self.computer.close().await
    }
}

/// Runs one task end to end. Teardown happens on every path out of here.
pub async fn run_task<C, M, T>(
    computer: C,
    bridge: &ResponseBridge<M>,
    tasks: &mut T,
    cfg: &PilotConfig,
) -> Result<RunReport, AgentError>
where
    C: Computer,
    M: ModelService,
    T: TaskSource + ?Sized,
{
    let run_id = new_run_id();
    let mut session = Session::new(computer, cfg.trace_path.clone());
    let outcome = drive(&mut session, bridge, tasks, cfg, &run_id).await;

    let keep_trace = !matches!(
        outcome,
        Ok(RunReport { status: RunStatus::Cancelled, .. })
    );
    let teardown = session.close(keep_trace).await;
    match (outcome, teardown) {
        (Ok(report), Ok(())) => {
            info!(run_id = %report.run_id, status = ?report.status, "Browser closed; done.");
            Ok(report)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            error!("browser close failed after run error: {}", close_err);
            Err(e)
        }
    }
}

async fn drive<C, M, T>(
    session: &mut Session<C>,
    bridge: &ResponseBridge<M>,
    tasks: &mut T,
    cfg: &PilotConfig,
    run_id: &str,
) -> Result<RunReport, AgentError>
where
    C: Computer,
    M: ModelService,
    T: TaskSource + ?Sized,
{
    session.begin(run_id, &cfg.start_url).await?;

    let task = match tasks.read_task().await? {
        TaskInput::Exit => {
            info!("exit requested, skipping the model");
            return Ok(RunReport::cancelled(run_id));
        }
        TaskInput::Task(task) => task,
    };
    let started = Instant::now();

    let scope = if cfg.seed_full_page { CaptureScope::FullPage } else { CaptureScope::Viewport };
    let seed = capture(session.computer(), scope).await?;
    info!("Sending first prompt to the model");
    let first = bridge.open(&cfg.instructions, task.as_str(), seed).await?;
    info!(response_id = %first.id, "entering action loop");

    let report = Agent::new(session.computer(), bridge, cfg.agent())
        .run(first)
        .await?;
    Ok(RunReport::from_loop(run_id, task.as_str(), report, started))
}
