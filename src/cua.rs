use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct CuaConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub model: String,         // e.g. "computer-use-preview"
    pub tool_display: (u32, u32),
    pub environment: String,   // "browser"
}

#[derive(Debug, Error)]
pub enum CuaError {
    #[error("OPENAI_API_KEY missing")]
    MissingKey,
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("OpenAI error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl CuaError {
    /// Rate limits, server errors and transport hiccups are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CuaError::Http(e) => e.is_timeout() || e.is_connect(),
            CuaError::Api { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            CuaError::MissingKey | CuaError::Decode(_) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseId(pub String);

impl std::fmt::Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded reply from the Responses API. Never mutated once built.
#[derive(Clone, Debug)]
pub struct ModelResponse {
    pub id: ResponseId,
    pub output: Vec<OutputItem>,
}

#[derive(Clone, Debug)]
pub enum OutputItem {
    ComputerCall(ActionRequest),
    Message { text: String },
    Reasoning { summary: Vec<String> },
    Other { kind: String },
}

#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub call_id: String,
    pub action: CuaAction,
    pub pending_safety_checks: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CuaAction {
    Click { x: i64, y: i64, button: Option<String> },
    Type { text: String },
    /// Scroll, keypress, drag and anything newer land here.
    Unsupported { kind: String },
    /// A known kind with missing or mistyped fields.
    Malformed { kind: String, reason: String },
}

impl CuaAction {
    pub fn kind(&self) -> &str {
        match self {
            CuaAction::Click { .. } => "click",
            CuaAction::Type { .. } => "type",
            CuaAction::Unsupported { kind } | CuaAction::Malformed { kind, .. } => kind,
        }
    }
}

impl std::fmt::Display for CuaAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CuaAction::Click { x, y, .. } => write!(f, "click({x}, {y})"),
            CuaAction::Type { text } => write!(f, "type({text:?})"),
            CuaAction::Unsupported { kind } => write!(f, "{kind}(unsupported)"),
            CuaAction::Malformed { kind, reason } => write!(f, "{kind}(malformed: {reason})"),
        }
    }
}

impl ModelResponse {
    /// Computer calls in encounter order.
    pub fn pending_actions(&self) -> impl Iterator<Item = &ActionRequest> {
        self.output.iter().filter_map(|o| match o {
            OutputItem::ComputerCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn last_message(&self) -> Option<&str> {
        self.output.iter().rev().find_map(|o| match o {
            OutputItem::Message { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn reasoning_summaries(&self) -> impl Iterator<Item = &str> {
        self.output.iter().flat_map(|o| match o {
            OutputItem::Reasoning { summary } => summary.iter().map(String::as_str).collect::<Vec<_>>(),
            _ => Vec::new(),
        })
    }
}

/// The opening request: task text plus the seed screenshot.
#[derive(Clone, Debug)]
pub struct OpeningTurn {
    pub instructions: String,
    pub task: String,
    pub image_url: String,
}

/// A screenshot sent back as the result of a specific computer call.
#[derive(Clone, Debug)]
pub struct ComputerCallOutput {
    pub call_id: String,
    pub image_url: String,
    pub acknowledged_safety_checks: Vec<Value>,
}

#[derive(Clone)]
pub struct CuaClient {
    http: Client,
    cfg: CuaConfig,
}

impl CuaClient {
    pub fn new(cfg: CuaConfig) -> Result<Self, CuaError> {
        if cfg.api_key.is_empty() {
            return Err(CuaError::MissingKey);
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    pub fn config(&self) -> &CuaConfig {
        &self.cfg
    }

    pub async fn open(&self, turn: &OpeningTurn) -> Result<ModelResponse, CuaError> {
        self.create(opening_request(&self.cfg, turn)).await
    }

    pub async fn send_computer_output(
        &self,
        previous: &ResponseId,
        output: &ComputerCallOutput,
    ) -> Result<ModelResponse, CuaError> {
        self.create(continuation_request(&self.cfg, previous, output)).await
    }

    async fn create(&self, body: Value) -> Result<ModelResponse, CuaError> {
        let url = format!("{}/responses", self.cfg.api_base);
        debug!(%url, "posting to responses endpoint");
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(CuaError::Api { status, body: text });
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| CuaError::Decode(format!("failed to parse OpenAI response JSON: {e}")))?;
        parse_response(v)
    }
}

fn computer_tool(cfg: &CuaConfig) -> Value {
    json!([{
        "type": "computer_use_preview",
        "display_width": cfg.tool_display.0,
        "display_height": cfg.tool_display.1,
        "environment": cfg.environment
    }])
}

pub fn opening_request(cfg: &CuaConfig, turn: &OpeningTurn) -> Value {
    json!({
      "model": cfg.model,
      "tools": computer_tool(cfg),
      "instructions": turn.instructions,
      "input": [
        { "role": "user", "content": [
            { "type": "input_text", "text": turn.task },
            { "type": "input_image", "image_url": turn.image_url }
        ]}
      ],
      "reasoning": { "generate_summary": "concise" },
      "truncation": "auto"
    })
}

pub fn continuation_request(
    cfg: &CuaConfig,
    previous: &ResponseId,
    output: &ComputerCallOutput,
) -> Value {
    let mut item = json!({
        "type": "computer_call_output",
        "call_id": output.call_id,
        "output": {
            "type": "input_image",
            "image_url": output.image_url
        }
    });
    if !output.acknowledged_safety_checks.is_empty() {
        item["acknowledged_safety_checks"] = Value::Array(output.acknowledged_safety_checks.clone());
    }
    json!({
      "model": cfg.model,
      "previous_response_id": previous.0,
      "tools": computer_tool(cfg),
      "input": [item],
      "truncation": "auto"
    })
}

pub fn parse_response(v: Value) -> Result<ModelResponse, CuaError> {
    // The Responses API returns: { id, output: [ ... ], status }
    let id = v
        .get("id")
        .and_then(|x| x.as_str())
        .map(|s| ResponseId(s.to_string()))
        .ok_or_else(|| CuaError::Decode("missing id".into()))?;

    let output = v
        .get("output")
        .and_then(|x| x.as_array())
        .map(|items| items.iter().map(decode_item).collect())
        .unwrap_or_default();

    Ok(ModelResponse { id, output })
}

fn decode_item(o: &Value) -> OutputItem {
    let kind = o.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
    match kind {
        "computer_call" => {
            // A call without an id cannot be answered, so it never becomes pending.
            let Some(call_id) = o.get("call_id").and_then(|x| x.as_str()).filter(|s| !s.is_empty())
            else {
                warn!("computer_call without call_id ignored");
                return OutputItem::Other { kind: "computer_call(no call_id)".into() };
            };
            OutputItem::ComputerCall(ActionRequest {
                call_id: call_id.to_string(),
                action: o.get("action").map(decode_action).unwrap_or_else(|| CuaAction::Malformed {
                    kind: "unknown".into(),
                    reason: "missing action".into(),
                }),
                pending_safety_checks: o
                    .get("pending_safety_checks")
                    .and_then(|x| x.as_array())
                    .cloned()
                    .unwrap_or_default(),
            })
        }
        "message" => {
            let text = o
                .get("content")
                .and_then(|c| c.as_array())
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            OutputItem::Message { text }
        }
        "reasoning" => OutputItem::Reasoning {
            summary: o
                .get("summary")
                .and_then(|s| s.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        other => OutputItem::Other { kind: other.to_string() },
    }
}

// Coordinates may arrive as 512 or 512.7; either way the click lands on the truncated integer.
fn coord(v: &Value, key: &str) -> Option<i64> {
    let n = v.get(key)?;
    n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))
}

fn decode_action(v: &Value) -> CuaAction {
    let kind = v
        .get("type")
        .and_then(|x| x.as_str())
        .unwrap_or("unknown")
        .to_string();
    match kind.as_str() {
        "click" => match (coord(v, "x"), coord(v, "y")) {
            (Some(x), Some(y)) => CuaAction::Click {
                x,
                y,
                button: v.get("button").and_then(|x| x.as_str()).map(|s| s.to_string()),
            },
            _ => CuaAction::Malformed { kind, reason: "x/y missing or not numeric".into() },
        },
        "type" => match v.get("text").and_then(|x| x.as_str()) {
            Some(text) => CuaAction::Type { text: text.to_string() },
            None => CuaAction::Malformed { kind, reason: "text missing or not a string".into() },
        },
        _ => CuaAction::Unsupported { kind },
    }
}
