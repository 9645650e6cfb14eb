//! Hive 操作台
//!
//! 入口：加载配置、装配组件，从标准输入读取操作员命令；工作流事件以 JSON 行输出到标准输出。
//! 实例 id 可只输入唯一前缀。

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use hive::config::load_config;
use hive::core::{run_with_graceful_shutdown, RegistryCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use hive::workflow::{ChannelEventSink, ResumeOutcome, StartOptions, WorkflowOrchestrator, WorkflowStatus};
use hive::{HiveBuilder, HiveComponents};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  start [--no-hitl] <task>     start a workflow
  approve <id> [note]          approve the proposed plan
  reject <id> [feedback]       reject the plan (or the pending extraction)
  reply <id> <text>            OK/YES/APPROVE accepts the step, anything else revises
  confirm <id> [json]          accept extracted data, optionally edited
  discard <id>                 reject extracted data
  status <id> | history <id>   diagnostics
  pending                      list paused workflows
  health                       probe all tool services
  quit";

#[derive(Debug, PartialEq)]
enum Command {
    Start { task: String, hitl: Option<bool> },
    Approve { id: String, note: Option<String> },
    Reject { id: String, feedback: Option<String> },
    Reply { id: String, text: String },
    Confirm { id: String, data: Option<serde_json::Value> },
    Discard { id: String },
    Status { id: String },
    History { id: String },
    Pending,
    Health,
    Help,
    Quit,
}

fn split_first(s: &str) -> (&str, Option<String>) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((head, rest)) if !rest.trim().is_empty() => (head, Some(rest.trim().to_string())),
        Some((head, _)) => (head, None),
        None => (s, None),
    }
}

fn parse_command(line: &str) -> Result<Command, String> {
    let (verb, rest) = split_first(line);
    let need_id = |rest: &Option<String>| -> Result<(String, Option<String>), String> {
        match rest {
            Some(r) => {
                let (id, tail) = split_first(r);
                Ok((id.to_string(), tail))
            }
            None => Err(format!("usage: {verb} <id> ...")),
        }
    };

    match verb.to_lowercase().as_str() {
        "start" => {
            let rest = rest.ok_or("usage: start [--no-hitl] <task>")?;
            let (flag, tail) = split_first(&rest);
            if flag == "--no-hitl" {
                let task = tail.ok_or("usage: start [--no-hitl] <task>")?;
                Ok(Command::Start { task, hitl: Some(false) })
            } else {
                Ok(Command::Start { task: rest, hitl: None })
            }
        }
        "approve" => {
            let (id, note) = need_id(&rest)?;
            Ok(Command::Approve { id, note })
        }
        "reject" => {
            let (id, feedback) = need_id(&rest)?;
            Ok(Command::Reject { id, feedback })
        }
        "reply" => {
            let (id, text) = need_id(&rest)?;
            let text = text.ok_or("usage: reply <id> <text>")?;
            Ok(Command::Reply { id, text })
        }
        "confirm" => {
            let (id, json) = need_id(&rest)?;
            let data = json
                .map(|j| serde_json::from_str(&j).map_err(|e| format!("invalid JSON: {e}")))
                .transpose()?;
            Ok(Command::Confirm { id, data })
        }
        "discard" => Ok(Command::Discard { id: need_id(&rest)?.0 }),
        "status" => Ok(Command::Status { id: need_id(&rest)?.0 }),
        "history" => Ok(Command::History { id: need_id(&rest)?.0 }),
        "pending" => Ok(Command::Pending),
        "health" => Ok(Command::Health),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "" => Err(String::new()),
        other => Err(format!("unknown command '{other}', try 'help'")),
    }
}

/// 用唯一前缀解析实例 id（只在暂停中的实例里匹配）
async fn resolve_id(orchestrator: &WorkflowOrchestrator, id: &str) -> String {
    let matches: Vec<_> = orchestrator
        .pending_ids()
        .await
        .into_iter()
        .filter(|p| p.starts_with(id))
        .collect();
    match matches.as_slice() {
        [only] => only.clone(),
        _ => id.to_string(),
    }
}

fn print_outcome(outcome: &ResumeOutcome) {
    match outcome {
        ResumeOutcome::Resumed { status } => println!("-> {status}"),
        ResumeOutcome::NotResumable { reason } => println!("-> not resumable: {reason}"),
    }
}

/// 独立线程读取标准输入，进程退出时不会阻塞运行时关闭
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), &tx));
    rx
}

/// 逐行转发，直到输入结束、读取出错或接收端关闭
fn forward_lines<R: BufRead>(reader: R, tx: &mpsc::UnboundedSender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

/// 处理一条命令；返回 false 表示退出
async fn handle(app: &HiveComponents, cmd: Command) -> anyhow::Result<bool> {
    let orch = &app.orchestrator;
    match cmd {
        Command::Start { task, hitl } => {
            match orch.start(&task, StartOptions { hitl }).await {
                Ok(id) => println!("started {id}"),
                Err(e) => println!("start failed: {e}"),
            }
        }
        Command::Approve { id, note } => {
            let id = resolve_id(orch, &id).await;
            print_outcome(&orch.resume_after_plan_approval(&id, true, note).await);
        }
        Command::Reject { id, feedback } => {
            let id = resolve_id(orch, &id).await;
            let outcome = match orch.pending(&id).await.map(|p| p.status()) {
                Some(WorkflowStatus::AwaitingStepApproval) => {
                    orch.resume_after_step_approval(&id, false, None).await
                }
                _ => orch.resume_after_plan_approval(&id, false, feedback).await,
            };
            print_outcome(&outcome);
        }
        Command::Reply { id, text } => {
            let id = resolve_id(orch, &id).await;
            print_outcome(&orch.resume_after_clarification(&id, &text).await);
        }
        Command::Confirm { id, data } => {
            let id = resolve_id(orch, &id).await;
            print_outcome(&orch.resume_after_step_approval(&id, true, data).await);
        }
        Command::Discard { id } => {
            let id = resolve_id(orch, &id).await;
            print_outcome(&orch.resume_after_step_approval(&id, false, None).await);
        }
        Command::Status { id } => {
            let id = resolve_id(orch, &id).await;
            match orch.context(&id).await {
                Some(ctx) => println!(
                    "{} status={} iteration={} agent={} error={}",
                    ctx.instance_id,
                    ctx.status,
                    ctx.iteration(),
                    ctx.current_agent().unwrap_or("-"),
                    ctx.error.as_deref().unwrap_or("-")
                ),
                None => println!("no such workflow (never started, or finished)"),
            }
        }
        Command::History { id } => {
            let id = resolve_id(orch, &id).await;
            match orch.history(&id).await {
                Some(history) => println!("{}", serde_json::to_string_pretty(&history)?),
                None => println!("no such workflow (never started, or finished)"),
            }
        }
        Command::Pending => {
            for id in orch.pending_ids().await {
                let status = orch.pending(&id).await.map(|p| p.status().to_string());
                println!("{id} {}", status.unwrap_or_default());
            }
        }
        Command::Health => {
            for report in app.registry.health_all().await {
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Config load failed, using defaults: {}", e);
            Default::default()
        }
    };

    let shutdown = Arc::new(ShutdownManager::new());
    let (sink, mut events) = ChannelEventSink::new();
    let components = HiveBuilder::new(cfg)
        .with_events(Arc::new(sink))
        .with_cancel_token(shutdown.child_token())
        .build();

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(RegistryCleanup::new(Arc::clone(&components.registry)));

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    println!("{HELP}");
    let app = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            let mut lines = spawn_stdin_reader();
            while let Some(line) = lines.recv().await {
                match parse_command(&line) {
                    Ok(cmd) => match handle(&components, cmd).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => println!("error: {e:#}"),
                    },
                    Err(msg) if msg.is_empty() => {}
                    Err(msg) => println!("{msg}"),
                }
            }
            shutdown.shutdown(ShutdownReason::Operator);
        }
    };

    run_with_graceful_shutdown(coordinator, app).await;
    Ok(())
}
