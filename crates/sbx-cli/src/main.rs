use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use sbx_client::{
    AnalysisApi, ApiClient, CorrelationController, CorrelationView, LatestProgress,
    ProgressChannel,
};
use sbx_core::{AnalysisTask, ChatMessage, ChatRequest, ProgressEvent};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

mod config;
mod logging;

use config::{load_config, Config, GlobalArgs};

#[derive(Parser)]
#[command(name = "sbx")]
#[command(about = "Sandbox analysis platform client", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List analysis tasks
    Tasks,
    /// Ask the analysis assistant a question
    Chat {
        message: String,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        page_context: Option<String>,
        /// JSON conversation file; earlier turns are sent and this turn is appended
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Follow background task progress until interrupted
    Progress,
    /// Show a task's processes annotated with ATT&CK techniques
    Correlate {
        task_id: String,
        /// Request a fresh AI insight in this mode before printing
        #[arg(long)]
        insight: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Tasks => "tasks",
            Commands::Chat { .. } => "chat",
            Commands::Progress => "progress",
            Commands::Correlate { .. } => "correlate",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    let _log_guard = logging::init_logging(&config, cli.command.name());
    let api = ApiClient::new(config.client.clone()).context("failed to build http client")?;

    match cli.command {
        Commands::Tasks => list_tasks(&api).await,
        Commands::Chat {
            message,
            task_id,
            page_context,
            history,
        } => {
            let earlier = match &history {
                Some(path) => load_history(path)?,
                None => Vec::new(),
            };
            let mut request = ChatRequest::new(message).with_history(earlier);
            if let Some(task_id) = task_id {
                request = request.with_task(task_id);
            }
            if let Some(context) = page_context {
                request = request.with_page_context(context);
            }
            let reply = chat(&api, &request).await?;
            if let Some(path) = &history {
                let mut turns = request.history;
                turns.push(ChatMessage::user(request.message));
                turns.push(ChatMessage::assistant(reply));
                save_history(path, &turns)?;
            }
            Ok(())
        }
        Commands::Progress => follow_progress(&config).await,
        Commands::Correlate { task_id, insight } => {
            correlate(api, &task_id, insight.as_deref()).await
        }
    }
}

async fn list_tasks(api: &ApiClient) -> Result<()> {
    let tasks = api.list_tasks().await.context("failed to list tasks")?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in &tasks {
        println!("{}", task_line(task));
    }
    Ok(())
}

fn task_line(task: &AnalysisTask) -> String {
    let verdict = match task.verdict_kind() {
        Some(verdict) => verdict.to_string(),
        None => task.verdict.clone().unwrap_or_else(|| "-".to_string()),
    };
    let score = task
        .risk_score
        .map(|score| score.to_string())
        .unwrap_or_else(|| "-".to_string());
    let name = task.original_filename.as_deref().unwrap_or(&task.filename);
    format!(
        "{:<12} {:<10} {:<10} {:>4}  {}  {}",
        task.id,
        task.status,
        verdict,
        score,
        format_millis(task.created_at),
        name
    )
}

async fn chat(api: &ApiClient, request: &ChatRequest) -> Result<String> {
    let reply = api
        .chat(request, |thought| eprintln!("thinking: {thought}"))
        .await
        .context("chat failed")?;
    if reply.response.is_empty() {
        warn!(event = "chat_no_final_answer");
    }
    println!("[{}] {}", reply.provider, reply.response);
    Ok(reply.response)
}

// A missing file is an empty conversation.
fn load_history(path: &Path) -> Result<Vec<ChatMessage>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse chat history {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read chat history {}", path.display()))
        }
    }
}

fn save_history(path: &Path, turns: &[ChatMessage]) -> Result<()> {
    let content = serde_json::to_string_pretty(turns)?;
    fs::write(path, content)
        .with_context(|| format!("failed to write chat history {}", path.display()))?;
    debug!(event = "chat_history_saved", path = %path.display(), turns = turns.len());
    Ok(())
}

async fn follow_progress(config: &Config) -> Result<()> {
    let endpoint = config
        .client
        .progress_endpoint()
        .context("cannot derive progress endpoint")?;
    let channel = ProgressChannel::connect(endpoint.clone())
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;

    let mut latest = LatestProgress::default();
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    channel
        .run(
            |event| {
                let previous = latest.record(event.clone());
                println!("{}", progress_line(&event, previous.as_ref()));
            },
            shutdown,
        )
        .await
        .context("progress channel failed")?;
    info!(event = "progress_stopped", tasks_seen = latest.len());
    Ok(())
}

fn progress_line(event: &ProgressEvent, previous: Option<&ProgressEvent>) -> String {
    let when = event
        .at()
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let mut line = format!(
        "{when} {} {:<14} {:>3}% {}",
        event.task_id, event.stage, event.percent, event.message
    );
    if let Some(previous) = previous.filter(|previous| previous.stage != event.stage) {
        line.push_str(&format!(" (after {})", previous.stage));
    }
    line
}

async fn correlate(api: ApiClient, task_id: &str, insight: Option<&str>) -> Result<()> {
    let controller = CorrelationController::new(api);
    let mut view = controller
        .load(task_id)
        .await
        .with_context(|| format!("failed to load task {task_id}"))?;
    if let Some(mode) = insight {
        controller
            .request_insight(&mut view, mode)
            .await
            .context("insight request failed")?;
    }
    print!("{}", render_view(&view));
    Ok(())
}

fn render_view(view: &CorrelationView) -> String {
    let task = view.task();
    let mut out = format!("task {} ({})\n", task.id, task.filename);
    match view.report() {
        Some(report) => {
            let verdict = report
                .verdict
                .map(|verdict| verdict.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push_str(&format!("verdict {verdict}, threat score {}\n", report.threat_score));
            if let Some(family) = &report.malware_family {
                out.push_str(&format!("family {family}\n"));
            }
        }
        None => out.push_str("no AI report\n"),
    }
    let processes = view.processes();
    for process in &processes {
        let techniques: Vec<&str> = view.techniques_for(process.pid).collect();
        out.push_str(&format!(
            "{:>6} <- {:<6} {:<24} {:<10} {}\n",
            process.pid,
            process.parent_pid,
            process.name,
            process.status,
            techniques.join(",")
        ));
    }
    let seen: BTreeSet<u32> = processes.iter().map(|process| process.pid).collect();
    for (pid, techniques) in view.index().iter().filter(|(pid, _)| !seen.contains(pid)) {
        let ids: Vec<&str> = techniques.iter().map(String::as_str).collect();
        out.push_str(&format!(
            "{pid:>6} (not in telemetry)                {}\n",
            ids.join(",")
        ));
    }
    out
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::ForensicReport;

    fn progress(stage: &str, percent: i64) -> ProgressEvent {
        ProgressEvent {
            task_id: "t-1".to_string(),
            stage: stage.to_string(),
            message: "working".to_string(),
            percent,
            timestamp: 0,
        }
    }

    #[test]
    fn cli_parses_subcommands_with_global_flags() {
        let cli = Cli::try_parse_from([
            "sbx",
            "correlate",
            "t-1",
            "--insight",
            "deep",
            "--api-url",
            "http://10.0.0.9:8080",
        ])
        .expect("parse");
        assert_eq!(cli.global.api_url, "http://10.0.0.9:8080");
        assert!(matches!(
            cli.command,
            Commands::Correlate { ref task_id, insight: Some(ref mode) } if task_id == "t-1" && mode == "deep"
        ));
    }

    #[test]
    fn progress_line_notes_stage_change() {
        let line = progress_line(&progress("ai_analysis", 150), Some(&progress("detonating", 40)));
        assert!(line.contains("150%"));
        assert!(line.ends_with("(after detonating)"));

        let same = progress_line(&progress("ai_analysis", 60), Some(&progress("ai_analysis", 50)));
        assert!(!same.contains("after"));
    }

    #[test]
    fn view_rendering_lists_annotated_processes() {
        let task: AnalysisTask = serde_json::from_value(serde_json::json!({
            "id": 3, "filename": "invoice.exe", "status": "Completed", "created_at": 0
        }))
        .expect("task");
        let events = serde_json::from_value(serde_json::json!([
            {"event_type": "PROCESS_CREATE", "process_id": 4120, "parent_process_id": 900,
             "process_name": "invoice.exe", "timestamp": 1}
        ]))
        .expect("events");
        let report: ForensicReport = serde_json::from_value(serde_json::json!({
            "verdict": "malicious",
            "threat_score": 88,
            "mitre_matrix": {"execution": [{"id": "T1204", "evidence": ["PID 4120 launched"]}]}
        }))
        .expect("report");

        let rendered = render_view(&CorrelationView::new(task.clone(), events, Some(report)));
        assert!(rendered.contains("verdict Malicious, threat score 88"));
        assert!(rendered.contains("T1204"));
        assert!(!rendered.contains("not in telemetry"));

        let bare = render_view(&CorrelationView::new(task, Vec::new(), None));
        assert!(bare.contains("no AI report"));
    }

    #[test]
    fn evidence_only_pids_are_listed_after_processes() {
        let task: AnalysisTask = serde_json::from_value(serde_json::json!({
            "id": "t-5", "filename": "loader.exe", "status": "Completed"
        }))
        .expect("task");
        let report: ForensicReport = serde_json::from_value(serde_json::json!({
            "mitre_matrix": {"persistence": [{"id": "T1547", "evidence": "ParentPID: 77 wrote Run key"}]}
        }))
        .expect("report");

        let rendered = render_view(&CorrelationView::new(task, Vec::new(), Some(report)));
        let line = rendered
            .lines()
            .find(|line| line.contains("not in telemetry"))
            .expect("evidence-only line");
        assert!(line.trim_start().starts_with("77"));
        assert!(line.ends_with("T1547"));
    }

    #[test]
    fn chat_history_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conversation.json");

        assert!(load_history(&path).expect("missing file").is_empty());

        let turns = vec![
            ChatMessage::user("Is invoice.exe malicious?"),
            ChatMessage::assistant("Yes, it drops a Run key."),
        ];
        save_history(&path, &turns).expect("save");
        assert_eq!(load_history(&path).expect("load"), turns);

        std::fs::write(&path, "not json").expect("corrupt");
        assert!(load_history(&path).is_err());
    }

    #[test]
    fn chat_accepts_history_file() {
        let cli = Cli::try_parse_from(["sbx", "chat", "and now?", "--history", "/tmp/c.json"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Chat { history: Some(ref path), .. } if path == Path::new("/tmp/c.json")
        ));
    }
}
