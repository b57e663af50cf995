//! Control surface for the decision pipeline.
//!
//! Exit codes: 0 on success, 1 on operator error, 2 when the system is (or
//! just went) halted.

use std::env;
use std::process;
use std::sync::Arc;

use alphaloop::broker::PaperBroker;
use alphaloop::config::Config;
use alphaloop::data::{FailoverFeed, StaticProvider};
use alphaloop::error::PipelineError;
use alphaloop::logging::{self, obj, v_str, Domain, Level};
use alphaloop::orchestrator::{Orchestrator, SystemMode};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("run");
    let code = match dispatch(cmd, &args[2..]).await {
        Ok(code) => code,
        Err(e) => {
            logging::log(
                Level::Fatal,
                Domain::System,
                "fatal",
                obj(&[("error", v_str(&e.to_string()))]),
            );
            e.exit_code()
        }
    };
    process::exit(code);
}

fn build(config: &Config) -> Result<Orchestrator, PipelineError> {
    let provider = StaticProvider::seeded(&config.symbols, config.history_bars);
    let feed = FailoverFeed::new(vec![Box::new(provider)], config.data_timeout_ms);
    let broker = Arc::new(PaperBroker::new(
        config.initial_capital,
        config.fee_rate,
        config.slip_rate,
    ));
    Orchestrator::new(config.clone(), feed, broker)
}

async fn dispatch(cmd: &str, rest: &[String]) -> Result<i32, PipelineError> {
    let config = Config::from_env();
    match cmd {
        "run" => {
            let cycles: u64 = rest.first().and_then(|v| v.parse().ok()).unwrap_or(1);
            let mut orch = build(&config)?;
            orch.start()?;
            for _ in 0..cycles {
                let report = orch.run_cycle().await?;
                if let Ok(line) = serde_json::to_string(&report) {
                    println!("{}", line);
                }
                if orch.mode() == SystemMode::EmergencyStop {
                    return Ok(2);
                }
            }
            Ok(0)
        }
        "status" => {
            let orch = build(&config)?;
            let status = orch.status()?;
            if let Ok(line) = serde_json::to_string_pretty(&status) {
                println!("{}", line);
            }
            Ok(0)
        }
        "pause" => {
            // The paused mode is durable, so the next `run` refuses to start
            // until an explicit resume.
            let mut orch = build(&config)?;
            if orch.mode() != SystemMode::Paused {
                orch.start()?;
                orch.pause()?;
            }
            Ok(0)
        }
        "resume" => {
            let mut orch = build(&config)?;
            orch.resume()?;
            Ok(0)
        }
        "stop" => {
            let reason = rest.first().map(String::as_str).unwrap_or("operator stop");
            let mut orch = build(&config)?;
            orch.emergency_stop(reason)?;
            Ok(0)
        }
        "reset" => {
            let mut orch = build(&config)?;
            orch.reset()?;
            Ok(0)
        }
        other => {
            eprintln!("unknown command: {}", other);
            eprintln!(
                "usage: alphaloop [run [cycles] | status | pause | resume | stop [reason] | reset]"
            );
            Ok(1)
        }
    }
}
