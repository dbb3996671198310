//! Thin demonstration binary: loads an `EngineConfig`, wires a
//! `WorkflowEngine` against file-backed ledger/quota stores, registers a
//! handful of echo tools, and drives one run through to GA (or until it
//! pauses) so the crate can be exercised without an embedder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use phaseforge::config::EngineConfig;
use phaseforge::coordinator::{ParallelismMode, PhaseManifest};
use phaseforge::dispatcher::{DispatchRequest, DispatchResponse, Dispatcher, Doer};
use phaseforge::engine::{PhaseManifestProvider, WorkflowEngine};
use phaseforge::errors::DispatchError;
use phaseforge::events::{ChannelEventSink, EventSink};
use phaseforge::gatekeeper::{Gatekeeper, Rubric};
use phaseforge::ledger::{LedgerStore, RunLedger};
use phaseforge::metrics::Recorder;
use phaseforge::model::{Artifact, ArtifactProvenance, Budget, Run, RunState, RuntimeClass, TaskSpec, TaskType, ToolManifest};
use phaseforge::quota::{QuotaEnforcer, QuotaStore};
use phaseforge::registry::{CallableManifest, Registry};

#[derive(Parser)]
#[command(name = "phaseforge")]
#[command(version, about = "Multi-phase workflow orchestrator core — demo run")]
struct Cli {
    /// Path to an `EngineConfig` TOML file; falls back to built-in defaults.
    #[arg(long, default_value = "phaseforge.toml")]
    config: PathBuf,

    /// Tenant id the demo run is attributed to.
    #[arg(long, default_value = "tenant-demo")]
    tenant: String,
}

/// Echoes a fixed artifact back for every task; stands in for a real
/// agent/tool backend in this demonstration binary.
struct EchoDoer;

#[async_trait]
impl Doer for EchoDoer {
    async fn invoke(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        Ok(DispatchResponse {
            ok: true,
            output: Some(serde_json::json!({"echoed": request.input})),
            artifacts: vec![Artifact::new(
                uuid::Uuid::new_v4().to_string(),
                "sha256:demo".into(),
                "generic",
                32,
                ArtifactProvenance {
                    producer: "tool.echo".into(),
                    when: Utc::now(),
                    input_artifact_ids: vec![],
                    tool_version: Some("1.0.0".into()),
                },
            )],
            duration_ms: 5,
            tokens: 100,
            tool_minutes: 0.02,
            cost_usd: 0.01,
            retry_count: 0,
            error: None,
            execution_id: format!("exec-{}", uuid::Uuid::new_v4()),
        })
    }
}

fn echo_tool_manifest() -> ToolManifest {
    ToolManifest {
        name: "tool.echo".into(),
        version: "1.0.0".into(),
        input_schema: serde_json::json!({}),
        output_schema: serde_json::json!({}),
        runtime: RuntimeClass::Native,
        timeout_ms: 60_000,
        resource_limits: HashMap::new(),
        egress_policy: "none".into(),
        tags: vec!["demo".into()],
        produces: vec!["generic".into()],
    }
}

/// One `tool.echo` task per phase, with a rubric that auto-passes any
/// non-empty evidence pack — this binary exists to demonstrate orchestration
/// wiring, not to grade real artifacts.
struct DemoPhases {
    config: EngineConfig,
}

impl PhaseManifestProvider for DemoPhases {
    fn manifest_for(&self, _run: &Run, phase: RunState) -> PhaseManifest {
        let task = TaskSpec::new(
            format!("{phase:?}-demo-task"),
            format!("{phase:?}"),
            TaskType::Tool,
            "tool.echo".into(),
            serde_json::json!({"phase": format!("{phase:?}")}),
            Budget::new(self.config.default_max_cost_usd / 20.0, self.config.default_max_tokens / 20, self.config.default_max_retries),
            vec![],
            Utc::now(),
        );
        PhaseManifest {
            phase: format!("{phase:?}"),
            parallelism: ParallelismMode::Sequential,
            tasks: vec![task],
            rubric: Rubric { weights: vec![], pass_threshold: 0.0, margin_error: 0.0 },
            partial_success_min_fraction: self.config.partial_success_min_fraction,
            max_gate_retries: 1,
            sem_allowlisted_tools: self.config.sem_allow_list.clone(),
        }
    }
}

/// Logs to stdout and to a daily-rotating file under `./logs`. Returns the
/// non-blocking writer's guard, which must stay alive for the process
/// lifetime or buffered log lines are dropped on exit.
fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_appender = tracing_appender::rolling::daily("logs", "phaseforge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)?;

    let mut registry = Registry::new();
    registry.register(CallableManifest::Tool(echo_tool_manifest()), Arc::new(EchoDoer));

    let ledger = RunLedger::new(LedgerStore::open(&PathBuf::from(&config.ledger_db_path))?);
    let quota = QuotaEnforcer::new(QuotaStore::open(&PathBuf::from(&config.quota_db_path))?, config.quota_throttle_penalty_ms);
    let (sink, mut rx) = ChannelEventSink::new();
    let events: Arc<dyn EventSink> = Arc::new(sink);

    let engine = WorkflowEngine::new(
        registry,
        Dispatcher::new(),
        Gatekeeper::new(vec![]),
        quota,
        ledger,
        Recorder::new(),
        events,
        Box::new(DemoPhases { config: config.clone() }),
    );

    let budget = Budget::new(config.default_max_cost_usd, config.default_max_tokens, config.default_max_retries);
    let mut run = engine.create_run(cli.tenant, "demo-user".into(), "demo-idea".into(), budget)?;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::info!(?event, "phase event");
        }
    });

    engine.execute(&mut run).await?;

    match run.state {
        RunState::Ga => println!("run {} reached GA, total cost ${:.4}", run.run_id, run.cumulative_cost_usd),
        RunState::Paused => println!(
            "run {} paused, would resume into {:?}",
            run.run_id, run.paused_from
        ),
        other => println!("run {} ended in unexpected state {other:?}", run.run_id),
    }

    Ok(())
}
