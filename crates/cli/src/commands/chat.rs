//! `pocketcode chat`: interactive or single-message session on the project.

use std::io::Write;
use std::sync::Arc;

use pocketcode_agent::{PlanState, Session, SessionConfig, ToolCoordinator, TurnOutcome};
use pocketcode_config::AppConfig;
use pocketcode_core::{AgentMode, EventBus};
use pocketcode_providers::{ModelRegistry, build_from_config};
use pocketcode_tools::{ProjectFileApplier, Sandbox, default_registry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::terminal::TerminalSurface;

type TerminalSession = Session<TerminalSurface<std::io::Stdout>>;

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Prompt(&'a str),
    Accept,
    Discard,
    Retry,
    Mode(&'a str),
    Model(&'a str),
    Help,
    Exit,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return match line {
            "exit" | "quit" => Input::Exit,
            _ => Input::Prompt(line),
        };
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    match name {
        "accept" | "a" => Input::Accept,
        "discard" | "reject" | "d" => Input::Discard,
        "retry" | "r" => Input::Retry,
        "mode" => Input::Mode(arg),
        "model" => Input::Model(arg),
        "help" | "?" => Input::Help,
        "exit" | "quit" | "q" => Input::Exit,
        _ => Input::Unknown(line),
    }
}

pub async fn run(
    model: Option<String>,
    message: Option<String>,
    mode: Option<AgentMode>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let router = build_from_config(&config)?;
    if router.list().is_empty() {
        eprintln!();
        eprintln!("  ERROR: No provider configured!");
        eprintln!();
        eprintln!("  Set POCKETCODE_API_KEY, or add a provider to:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No provider configured. See above for setup instructions.".into());
    }

    let registry = ModelRegistry::new(config.model_infos());
    let model_id = model.unwrap_or_else(|| config.default_model.clone());
    let model = registry.resolve(&model_id, &config.default_provider);

    let root = &config.workspace.root;
    let event_bus = Arc::new(EventBus::default());
    trace_events(&event_bus);
    let tools = ToolCoordinator::new(default_registry(root), config.agent.max_parallel_tools)
        .with_event_bus(Arc::clone(&event_bus));
    let applier = Arc::new(ProjectFileApplier::new(Sandbox::new(root)));

    let mut settings = SessionConfig::from(&config.agent);
    if let Some(mode) = mode {
        settings.mode = mode;
    }

    debug!(model = %model.id, provider = %model.provider, root = %root.display(), "Starting session");
    let mut session = Session::new(
        Arc::new(router),
        model,
        tools,
        applier,
        TerminalSurface::stdout(),
    )
    .with_config(settings)
    .with_event_bus(event_bus);

    if let Some(message) = message {
        let outcome = session.send(message).await;
        report(&outcome);
        return match outcome {
            TurnOutcome::Failed { message, .. } => Err(message.into()),
            _ => Ok(()),
        };
    }

    println!();
    println!("  PocketCode");
    println!();
    println!("  Model:     {} [{}]", session.model().id, session.model().provider);
    println!("  Mode:      {:?}", session.mode());
    println!("  Project:   {}", root.display());
    println!();
    println!("  Type your message and press Enter. /help lists commands.");
    println!("  Ctrl+C cancels a running reply; press it again to quit.");
    println!();

    // Ctrl+C cancels the turn in flight, or quits when idle
    let canceller = session.canceller();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !canceller.cancel() {
                std::process::exit(130);
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Input::Prompt("") => {}
            Input::Prompt(text) => {
                let outcome = session.send(text).await;
                report(&outcome);
            }
            Input::Accept => accept(&mut session).await,
            Input::Discard => discard(&mut session),
            Input::Retry => match session.retry().await {
                Some(outcome) => report(&outcome),
                None => println!("  Nothing to retry."),
            },
            Input::Mode(arg) => match arg.parse::<AgentMode>() {
                Ok(mode) => {
                    session.set_mode(mode);
                    println!("  Mode set to {mode:?}.");
                }
                Err(e) => println!("  {e}"),
            },
            Input::Model("") => println!("  Current model: {}", session.model().id),
            Input::Model(id) => {
                session.set_model(registry.resolve(id, &config.default_provider));
                println!("  Switched to {}.", session.model().id);
            }
            Input::Help => help(),
            Input::Exit => break,
            Input::Unknown(line) => println!("  Unknown command: {line}. /help lists commands."),
        }
        prompt()?;
    }

    println!("  Goodbye!");
    Ok(())
}

/// Mirror domain events into the debug log.
fn trace_events(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => debug!(event = event.name(), at = %event.timestamp(), "{event:?}"),
                Err(RecvError::Lagged(missed)) => debug!(missed, "Event observer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn awaiting_plan_decision(session: &TerminalSession) -> bool {
    session
        .plan()
        .is_some_and(|p| matches!(p.state(), PlanState::AwaitingDecision { .. }))
}

async fn accept(session: &mut TerminalSession) {
    if awaiting_plan_decision(session) {
        match session.accept_plan_step().await {
            Ok(outcome) => report(&outcome),
            Err(e) => println!("  {e}"),
        }
    } else if session.pending_changes().is_empty() {
        println!("  No changes waiting.");
    } else {
        session.accept_pending_changes().await;
    }
}

fn discard(session: &mut TerminalSession) {
    if awaiting_plan_decision(session) {
        if let Err(e) = session.discard_plan_step() {
            println!("  {e}");
        }
    } else if session.reject_pending_changes() == 0 {
        println!("  No changes waiting.");
    }
}

/// Hints for outcomes that need the user.
fn report(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::ChangesPending { count } => {
            println!("  {count} change(s) proposed. /accept to apply, /discard to drop.");
        }
        TurnOutcome::PlanReview { index } => {
            println!("  Step {} ready. /accept to apply and continue, /discard to stop.", index + 1);
        }
        _ => {}
    }
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

fn help() {
    println!("  /accept         apply pending changes or the current plan step");
    println!("  /discard        drop pending changes or halt the plan");
    println!("  /retry          send the last prompt again");
    println!("  /mode <mode>    copilot or agent");
    println!("  /model [id]     show or switch the model");
    println!("  /exit           quit");
}
