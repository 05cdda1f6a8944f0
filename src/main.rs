use anyhow::Result;
use screenpilot::{
    run_task, ChromiumComputer, CuaClient, FixedTask, PilotConfig, ResponseBridge, RunReport,
    StdinPrompt, TaskSource,
};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(report) => {
            info!(
                status = ?report.status,
                iterations = report.metrics.iterations,
                actions = report.metrics.actions,
                "run finished"
            );
            if let Some(msg) = &report.final_message {
                println!("{}", msg);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("run failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<RunReport> {
    let cfg = PilotConfig::from_env()?;
    let client = CuaClient::new(cfg.cua())?;
    let bridge = ResponseBridge::new(client, cfg.retry.clone())
        .acknowledge_safety_checks(cfg.acknowledge_safety_checks);

    // PILOT_TASK skips the interactive prompt
    let mut tasks: Box<dyn TaskSource> = match std::env::var("PILOT_TASK") {
        Ok(task) if !task.trim().is_empty() => Box::new(FixedTask(task)),
        _ => Box::new(StdinPrompt),
    };

    let computer = ChromiumComputer::launch(cfg.browser()).await?;
    let report = run_task(computer, &bridge, tasks.as_mut(), &cfg).await?;
    Ok(report)
}
