use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{AgentError, Computer, LoadState};
use crate::cua::CuaAction;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub display: (u32, u32),
    pub click_settle_timeout: Duration,
    pub type_delay: Duration,
}

/// How an action finished. Only automation failures come back as `Err`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    Settled,
    SettleTimedOut,
    Unsupported,
}

impl Execution {
    pub fn as_str(self) -> &'static str {
        match self {
            Execution::Settled => "ok",
            Execution::SettleTimedOut => "settle_timeout",
            Execution::Unsupported => "unsupported",
        }
    }
}

pub async fn execute<C: Computer + ?Sized>(
    computer: &C,
    action: &CuaAction,
    cfg: &ExecutorConfig,
) -> Result<Execution, AgentError> {
    match action {
        CuaAction::Click { x, y, button } => {
            let (w, h) = cfg.display;
            if *x < 0 || *y < 0 || *x >= i64::from(w) || *y >= i64::from(h) {
                warn!(x, y, width = w, height = h, "click outside the viewport");
            }
            if let Some(b) = button.as_deref().filter(|b| *b != "left") {
                warn!(button = b, "non-left button requested, clicking left");
            }
            computer.click(*x, *y).await?;
            info!(x, y, "clicked");
            match computer
                .wait_for_load_state(LoadState::DomContentLoaded, cfg.click_settle_timeout)
                .await
            {
                Ok(()) => Ok(Execution::Settled),
                Err(AgentError::Timeout(msg)) => {
                    warn!(timeout_ms = cfg.click_settle_timeout.as_millis() as u64, "{msg}; continuing");
                    Ok(Execution::SettleTimedOut)
                }
                Err(e) => Err(e),
            }
        }
        CuaAction::Type { text } => {
            computer.type_text(text, cfg.type_delay).await?;
            info!(chars = text.chars().count(), "typed '{}'", text);
            Ok(Execution::Settled)
        }
        CuaAction::Unsupported { kind } => {
            warn!(kind = %kind, "unsupported action, skipping");
            Ok(Execution::Unsupported)
        }
        CuaAction::Malformed { kind, reason } => {
            warn!(kind = %kind, %reason, "malformed action, skipping");
            Ok(Execution::Unsupported)
        }
    }
}
