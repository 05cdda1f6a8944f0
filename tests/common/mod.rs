#![allow(dead_code)]

use async_trait::async_trait;
use screenpilot::agent::{AgentError, Computer, LoadState, ModelService};
use screenpilot::browser::keystrokes;
use screenpilot::cua::{parse_response, ComputerCallOutput, ModelResponse, OpeningTurn, ResponseId};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Navigate(String),
    Click(i64, i64),
    Key(String),
    Wait(LoadState),
    Screenshot { full_page: bool },
    StartTrace,
    StopTrace(Option<PathBuf>),
    Close,
}

#[derive(Clone, Default)]
pub struct FakeComputer {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub key_times: Arc<Mutex<Vec<Instant>>>,
    pub fail_click: bool,
    pub fail_navigate: bool,
    pub settle_times_out: bool,
}

impl FakeComputer {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|&c| pred(c)).count()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Computer for FakeComputer {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        self.push(Call::Navigate(url.to_string()));
        if self.fail_navigate {
            return Err(AgentError::Computer("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        Ok(())
    }

    async fn click(&self, x: i64, y: i64) -> Result<(), AgentError> {
        self.push(Call::Click(x, y));
        if self.fail_click {
            return Err(AgentError::Computer("target closed".into()));
        }
        Ok(())
    }

    async fn type_text(&self, text: &str, per_char_delay: Duration) -> Result<(), AgentError> {
        for key in keystrokes(text) {
            self.push(Call::Key(key));
            self.key_times.lock().unwrap().push(Instant::now());
            sleep(per_char_delay).await;
        }
        Ok(())
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<(), AgentError> {
        self.push(Call::Wait(state));
        if self.settle_times_out {
            return Err(AgentError::Timeout(format!("{}ms", timeout.as_millis())));
        }
        Ok(())
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, AgentError> {
        self.push(Call::Screenshot { full_page });
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn start_tracing(&self, _run_id: &str) -> Result<(), AgentError> {
        self.push(Call::StartTrace);
        Ok(())
    }

    async fn stop_tracing(&self, path: Option<&Path>) -> Result<(), AgentError> {
        self.push(Call::StopTrace(path.map(Path::to_path_buf)));
        Ok(())
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.push(Call::Close);
        Ok(())
    }
}

/// Plays back queued responses; once the queue is empty, repeats `fallback` (or fails).
#[derive(Clone, Default)]
pub struct ScriptedModel {
    pub script: Arc<Mutex<VecDeque<Result<ModelResponse, AgentError>>>>,
    pub fallback: Option<Value>,
    pub opened: Arc<Mutex<Vec<OpeningTurn>>>,
    pub continued: Arc<Mutex<Vec<(ResponseId, ComputerCallOutput)>>>,
    counter: Arc<Mutex<usize>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ModelResponse, AgentError>>) -> Self {
        Self { script: Arc::new(Mutex::new(script.into())), ..Default::default() }
    }

    /// Every call answers with one fresh click request.
    pub fn always_clicking() -> Self {
        Self {
            fallback: Some(json!([{ "type": "computer_call", "action": { "type": "click", "x": 5, "y": 6 } }])),
            ..Default::default()
        }
    }

    pub fn continued(&self) -> Vec<(ResponseId, ComputerCallOutput)> {
        self.continued.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<OpeningTurn> {
        self.opened.lock().unwrap().clone()
    }

    fn next(&self) -> Result<ModelResponse, AgentError> {
        if let Some(r) = self.script.lock().unwrap().pop_front() {
            return r;
        }
        let mut n = self.counter.lock().unwrap();
        *n += 1;
        match &self.fallback {
            Some(output) => {
                let mut output = output.clone();
                for (i, item) in output.as_array_mut().into_iter().flatten().enumerate() {
                    item["call_id"] = json!(format!("call_{}_{}", *n, i));
                }
                Ok(response(&format!("resp_auto_{}", *n), output))
            }
            None => Err(AgentError::Model { message: "script exhausted".into(), retryable: false }),
        }
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn open(&self, turn: &OpeningTurn) -> Result<ModelResponse, AgentError> {
        self.opened.lock().unwrap().push(turn.clone());
        self.next()
    }

    async fn continue_turn(
        &self,
        previous: &ResponseId,
        output: &ComputerCallOutput,
    ) -> Result<ModelResponse, AgentError> {
        self.continued.lock().unwrap().push((previous.clone(), output.clone()));
        self.next()
    }
}

pub fn response(id: &str, output: Value) -> ModelResponse {
    parse_response(json!({ "id": id, "output": output })).unwrap()
}

pub fn click(call_id: &str, x: Value, y: Value) -> Value {
    json!({ "type": "computer_call", "call_id": call_id, "action": { "type": "click", "x": x, "y": y } })
}

pub fn type_text(call_id: &str, text: &str) -> Value {
    json!({ "type": "computer_call", "call_id": call_id, "action": { "type": "type", "text": text } })
}

pub fn message(text: &str) -> Value {
    json!({ "type": "message", "content": [{ "type": "output_text", "text": text }] })
}

pub fn done(id: &str) -> ModelResponse {
    response(id, json!([message("All done.")]))
}
