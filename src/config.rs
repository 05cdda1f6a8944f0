use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::{ActionSelection, AgentConfig};
use crate::bridge::RetryConfig;
use crate::browser::BrowserConfig;
use crate::cua::CuaConfig;

pub const DISPLAY_WIDTH: u32 = 1024;
pub const DISPLAY_HEIGHT: u32 = 768;
pub const ITERATIONS: usize = 5;
pub const MODEL: &str = "computer-use-preview";
pub const START_URL: &str = "https://www.bing.com";

pub const DEFAULT_INSTRUCTIONS: &str = "You are an AI agent controlling a browser. \
After each action, take a screenshot to verify success. \
When done, return control.";

/// Startup constants for one run. Built once and passed down by reference.
#[derive(Clone, Debug)]
pub struct PilotConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub display_width: u32,
    pub display_height: u32,
    pub iterations: usize,
    pub start_url: String,
    /// `None` disables the trace bundle.
    pub trace_path: Option<PathBuf>,
    pub headless: bool,
    /// Full-page capture for the seed screenshot only; loop captures are always viewport.
    pub seed_full_page: bool,
    pub click_settle_timeout: Duration,
    pub type_delay: Duration,
    pub action_selection: ActionSelection,
    pub acknowledge_safety_checks: bool,
    pub retry: RetryConfig,
    pub instructions: String,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            api_key: String::new(),
            model: MODEL.into(),
            display_width: DISPLAY_WIDTH,
            display_height: DISPLAY_HEIGHT,
            iterations: ITERATIONS,
            start_url: START_URL.into(),
            trace_path: Some(PathBuf::from("trace")),
            headless: true,
            seed_full_page: false,
            click_settle_timeout: Duration::from_millis(3000),
            type_delay: Duration::from_millis(20),
            action_selection: ActionSelection::First,
            acknowledge_safety_checks: true,
            retry: RetryConfig::default(),
            instructions: DEFAULT_INSTRUCTIONS.into(),
        }
    }
}

impl PilotConfig {
    /// Defaults overlaid with whatever the environment provides.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(base) = env::var("OPENAI_BASE_URL") {
            cfg.api_base = base.trim_end_matches('/').to_string();
        }
        cfg.api_key = env::var("OPENAI_API_KEY").unwrap_or_default();
        if let Ok(model) = env::var("OPENAI_CUA_MODEL") {
            cfg.model = model;
        }
        if let Ok(url) = env::var("PILOT_START_URL") {
            cfg.start_url = url;
        }
        if let Ok(path) = env::var("PILOT_TRACE_PATH") {
            cfg.trace_path = if path.trim().is_empty() { None } else { Some(PathBuf::from(path)) };
        }
        if let Some(n) = parse_var("PILOT_ITERATIONS")? {
            cfg.iterations = n;
        }
        if let Some(h) = parse_var("PILOT_HEADLESS")? {
            cfg.headless = h;
        }
        if let Some(f) = parse_var("PILOT_SEED_FULL_PAGE")? {
            cfg.seed_full_page = f;
        }
        if let Some(r) = parse_var("PILOT_MAX_RETRIES")? {
            cfg.retry.max_retries = r;
        }
        Ok(cfg)
    }

    pub fn cua(&self) -> CuaConfig {
        CuaConfig {
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            tool_display: (self.display_width, self.display_height),
            environment: "browser".into(),
        }
    }

    pub fn browser(&self) -> BrowserConfig {
        BrowserConfig {
            headless: self.headless,
            width: self.display_width,
            height: self.display_height,
            user_agent: None,
        }
    }

    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            iterations: self.iterations,
            display: (self.display_width, self.display_height),
            click_settle_timeout: self.click_settle_timeout,
            type_delay: self.type_delay,
            selection: self.action_selection,
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fixed_constants() {
        let cfg = PilotConfig::default();
        assert_eq!((cfg.display_width, cfg.display_height), (1024, 768));
        assert_eq!(cfg.iterations, 5);
        assert_eq!(cfg.model, "computer-use-preview");
        assert_eq!(cfg.click_settle_timeout, Duration::from_millis(3000));
        assert_eq!(cfg.type_delay, Duration::from_millis(20));
        assert!(!cfg.seed_full_page);
        assert_eq!(cfg.action_selection, ActionSelection::First);
    }

    #[test]
    fn derived_views_carry_display_size() {
        let cfg = PilotConfig { display_width: 800, display_height: 600, ..Default::default() };
        assert_eq!(cfg.cua().tool_display, (800, 600));
        assert_eq!(cfg.agent().display, (800, 600));
        let b = cfg.browser();
        assert_eq!((b.width, b.height), (800, 600));
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("SCREENPILOT_TEST_ITERS", "five");
        let res: Result<Option<usize>> = parse_var("SCREENPILOT_TEST_ITERS");
        assert!(res.is_err());
        env::set_var("SCREENPILOT_TEST_ITERS", " 7 ");
        let res: Option<usize> = parse_var("SCREENPILOT_TEST_ITERS").unwrap();
        assert_eq!(res, Some(7));
        env::remove_var("SCREENPILOT_TEST_ITERS");
    }
}
