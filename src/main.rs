use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adforge_backend_core::config::{default_app_root, AppConfig};
use adforge_backend_core::db::{NewWorkItem, WorkItemFilter, WorkItemStore};
use adforge_backend_core::work_item::{InputSnapshot, WorkItemKind, WorkItemStatus};
use adforge_backend_core::{build_dispatcher, build_engine, build_executor, open_store};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 1_800;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let Some(command) = cli_args.first().cloned() else {
        print_usage();
        return Ok(());
    };
    let args = cli_args.into_iter().skip(1).collect::<Vec<_>>();
    if matches!(command.as_str(), "-h" | "--help" | "help")
        || args
            .iter()
            .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }

    let parsed = parse_cli_args(args.as_slice())?;
    let app_root = parsed.app_root.clone().unwrap_or_else(default_app_root);
    let config = Arc::new(AppConfig::load(
        app_root.as_path(),
        parsed.config_path.as_deref(),
    )?);

    match command.as_str() {
        "submit" => run_submit_cli(&config, &parsed),
        "launch" => run_launch_cli(config, parsed).await,
        "run" => run_foreground_cli(config, parsed).await,
        "republish" => run_republish_cli(config, parsed).await,
        "status" => run_status_cli(&config, &parsed),
        "list" => run_list_cli(&config, &parsed),
        unknown => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliArgs {
    app_root: Option<PathBuf>,
    config_path: Option<String>,
    id: Option<String>,
    kind: Option<WorkItemKind>,
    input_json: Option<String>,
    input_file: Option<PathBuf>,
    draft: bool,
    wait: bool,
    trace: bool,
    status: Option<WorkItemStatus>,
    limit: Option<usize>,
    timeout_secs: Option<u64>,
}

impl CliArgs {
    fn require_id(&self) -> Result<String, Box<dyn std::error::Error>> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| std::io::Error::other("Missing required --id").into())
    }

    fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS))
    }
}

fn parse_cli_args(args: &[String]) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let mut parsed = CliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--app-root" => {
                parsed.app_root = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--config" => {
                parsed.config_path = Some(needs_value(i)?);
                i += 2;
            }
            "--id" => {
                parsed.id = Some(needs_value(i)?);
                i += 2;
            }
            "--kind" => {
                let raw = needs_value(i)?;
                parsed.kind = Some(WorkItemKind::parse(raw.as_str()).ok_or_else(|| {
                    std::io::Error::other(format!("Invalid --kind '{raw}' (expected test|flow)"))
                })?);
                i += 2;
            }
            "--input-json" => {
                parsed.input_json = Some(needs_value(i)?);
                i += 2;
            }
            "--input-file" => {
                parsed.input_file = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--status" => {
                let raw = needs_value(i)?;
                parsed.status = Some(WorkItemStatus::parse(raw.as_str()).ok_or_else(|| {
                    std::io::Error::other(format!("Invalid --status '{raw}'"))
                })?);
                i += 2;
            }
            "--limit" => {
                let raw = needs_value(i)?;
                parsed.limit = Some(raw.parse::<usize>().map_err(|_| {
                    std::io::Error::other(format!("Invalid --limit '{raw}'"))
                })?);
                i += 2;
            }
            "--timeout-secs" => {
                let raw = needs_value(i)?;
                parsed.timeout_secs = Some(raw.parse::<u64>().map_err(|_| {
                    std::io::Error::other(format!("Invalid --timeout-secs '{raw}'"))
                })?);
                i += 2;
            }
            "--draft" => {
                parsed.draft = true;
                i += 1;
            }
            "--wait" => {
                parsed.wait = true;
                i += 1;
            }
            "--trace" => {
                parsed.trace = true;
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }
    Ok(parsed)
}

fn read_input_snapshot(parsed: &CliArgs) -> Result<InputSnapshot, Box<dyn std::error::Error>> {
    let raw = match (&parsed.input_json, &parsed.input_file) {
        (Some(_), Some(_)) => {
            return Err(
                std::io::Error::other("Use either --input-json or --input-file, not both").into(),
            )
        }
        (Some(inline), None) => inline.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            return Err(std::io::Error::other("Missing --input-json or --input-file").into())
        }
    };
    let value: serde_json::Value = serde_json::from_str(raw.as_str())?;
    InputSnapshot::from_json(value).map_err(|e| std::io::Error::other(e).into())
}

fn run_submit_cli(config: &AppConfig, parsed: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let kind = parsed
        .kind
        .ok_or_else(|| std::io::Error::other("Missing required --kind"))?;
    let input_snapshot = read_input_snapshot(parsed)?;
    let store = open_store(config)?;
    let item = store.create(NewWorkItem {
        id: parsed.id.clone(),
        kind,
        input_snapshot,
        status: if parsed.draft {
            WorkItemStatus::Draft
        } else {
            WorkItemStatus::Queued
        },
    })?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"ok": true, "work_item": item}))?
    );
    Ok(())
}

/// The process stays alive until the run leaves `running`; `--wait` also
/// prints the final status.
async fn run_launch_cli(
    config: Arc<AppConfig>,
    parsed: CliArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parsed.require_id()?;
    let store = open_store(&config)?;
    let engine = build_engine(&config, store.clone());
    let executor = build_executor(&config, engine);
    let dispatcher = build_dispatcher(store, executor);

    let outcome = dispatcher.launch(id.as_str())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"ok": true, "launch": outcome}))?
    );
    if !outcome.started && !parsed.wait {
        return Ok(());
    }

    let timeout = parsed.wait_timeout();
    let include_trace = parsed.trace;
    let view = tokio::task::spawn_blocking(move || {
        dispatcher.wait_for_terminal(id.as_str(), WAIT_POLL_INTERVAL, timeout, include_trace)
    })
    .await??;
    if parsed.wait {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"ok": true, "status": view}))?
        );
    }
    Ok(())
}

async fn run_foreground_cli(
    config: Arc<AppConfig>,
    parsed: CliArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parsed.require_id()?;
    let store = open_store(&config)?;
    let engine = build_engine(&config, store);
    let report = tokio::task::spawn_blocking(move || engine.claim_and_run(id.as_str())).await??;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "started": report.is_some(),
            "report": report
        }))?
    );
    Ok(())
}

async fn run_republish_cli(
    config: Arc<AppConfig>,
    parsed: CliArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = parsed.require_id()?;
    let store = open_store(&config)?;
    let engine = build_engine(&config, store);
    let item = tokio::task::spawn_blocking(move || engine.republish_page(id.as_str())).await??;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "page": item.result_fragments.page()
        }))?
    );
    Ok(())
}

fn run_status_cli(config: &AppConfig, parsed: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let id = parsed.require_id()?;
    let store = open_store(config)?;
    let item = store.get(id.as_str())?;
    let trace = if parsed.trace {
        Some(adforge_backend_core::db::StepTracer::list(store.as_ref(), id.as_str())?)
    } else {
        None
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "status": item.status,
            "result_fragments": item.result_fragments,
            "last_error": item.last_error,
            "trace": trace
        }))?
    );
    Ok(())
}

fn run_list_cli(config: &AppConfig, parsed: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config)?;
    let items = store.list(
        &WorkItemFilter {
            status: parsed.status,
            kind: parsed.kind,
        },
        parsed.limit.unwrap_or(50),
    )?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "count": items.len(),
            "work_items": items
        }))?
    );
    Ok(())
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  adforge-backend-core submit --kind test|flow (--input-json JSON | --input-file PATH) [--id ID] [--draft]\n",
        "  adforge-backend-core launch --id ID [--wait] [--trace] [--timeout-secs N]\n",
        "  adforge-backend-core run --id ID\n",
        "  adforge-backend-core republish --id ID\n",
        "  adforge-backend-core status --id ID [--trace]\n",
        "  adforge-backend-core list [--status S] [--kind K] [--limit N]\n\n",
        "Common flags:\n",
        "  --app-root PATH   defaults to ADFORGE_APP_ROOT or the working directory\n",
        "  --config PATH     defaults to ADFORGE_CONFIG or config/adforge.settings.toml\n"
    ));
}
