pub mod agent;
pub mod bridge;
pub mod browser;
pub mod capture;
pub mod config;
pub mod cua;
pub mod executor;
pub mod session;
pub mod trace;

pub use agent::{Agent, AgentConfig, AgentError, ChromiumComputer, Computer, ModelService, RunReport, RunStatus};
pub use bridge::{ResponseBridge, RetryConfig};
pub use browser::{Browser, BrowserConfig};
pub use config::PilotConfig;
pub use cua::{CuaClient, CuaConfig};
pub use session::{run_task, FixedTask, StdinPrompt, TaskSource};
