//! Line commands read from stdin while `chorus run` is active.

use chorus_merge::EscalationAction;
use chorus_orchestrator::{RollbackLevel, RollbackRequest};
use chorus_session::Mode;

/// One parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Tasks,
    Add { title: String },
    Spawn { task_id: String },
    Stop { agent_id: String },
    StopAll,
    Unblock { agent_id: String },
    Pause,
    Resume,
    Mode(Mode),
    Merge { branch: String, priority: Option<u8> },
    Resolve(EscalationAction),
    Checkpoint,
    Rollback(RollbackRequest),
    Help,
    Quit,
}

/// Console help text.
pub const HELP: &str = "\
commands:
  status                         agents, slots, merge queue and stats
  tasks                          list tasks
  add <title>                    create a task
  spawn <task-id>                run an agent on a task
  stop <agent-id> | stop all     stop agents (worktree changes are stashed)
  unblock <agent-id>             resume a blocked agent
  pause | resume                 stop or restart scheduling and merging
  mode autopilot|semi-auto       switch orchestration mode
  merge <branch> [priority]      queue an operator branch (priority 0-4)
  resolve merged|skipped|cancelled
                                 decide the pending merge escalation
  checkpoint                     tag the current HEAD
  rollback iteration <agent-id> [n]
  rollback task|chain <task-id>
  rollback session
  quit                           stop all agents and exit";

fn arg<'a>(words: &[&'a str], index: usize, usage: &str) -> Result<&'a str, String> {
    words
        .get(index)
        .copied()
        .ok_or_else(|| format!("usage: {usage}"))
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some(&verb) = words.first() else {
        return Ok(None);
    };

    let command = match verb {
        "status" => ConsoleCommand::Status,
        "tasks" => ConsoleCommand::Tasks,
        "add" => {
            let title = line.trim_start().trim_start_matches("add").trim();
            if title.is_empty() {
                return Err("usage: add <title>".into());
            }
            ConsoleCommand::Add {
                title: title.to_string(),
            }
        }
        "spawn" => ConsoleCommand::Spawn {
            task_id: arg(&words, 1, "spawn <task-id>")?.to_string(),
        },
        "stop" => match arg(&words, 1, "stop <agent-id> | stop all")? {
            "all" => ConsoleCommand::StopAll,
            id => ConsoleCommand::Stop {
                agent_id: id.to_string(),
            },
        },
        "unblock" => ConsoleCommand::Unblock {
            agent_id: arg(&words, 1, "unblock <agent-id>")?.to_string(),
        },
        "pause" => ConsoleCommand::Pause,
        "resume" => ConsoleCommand::Resume,
        "mode" => {
            let mode = arg(&words, 1, "mode autopilot|semi-auto")?;
            ConsoleCommand::Mode(mode.parse().map_err(|e| format!("{e}"))?)
        }
        "merge" => {
            let branch = arg(&words, 1, "merge <branch> [priority]")?.to_string();
            let priority = match words.get(2) {
                Some(p) => Some(
                    p.parse::<u8>()
                        .map_err(|_| format!("invalid priority: {p}"))?,
                ),
                None => None,
            };
            ConsoleCommand::Merge { branch, priority }
        }
        "resolve" => {
            let action = match arg(&words, 1, "resolve merged|skipped|cancelled")? {
                "merged" => EscalationAction::Merged,
                "skipped" | "skip" => EscalationAction::Skipped,
                "cancelled" | "cancel" => EscalationAction::Cancelled,
                other => return Err(format!("unknown escalation action: {other}")),
            };
            ConsoleCommand::Resolve(action)
        }
        "checkpoint" => ConsoleCommand::Checkpoint,
        "rollback" => ConsoleCommand::Rollback(parse_rollback(&words[1..])?),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command: {other} (try 'help')")),
    };
    Ok(Some(command))
}

fn parse_rollback(words: &[&str]) -> Result<RollbackRequest, String> {
    let level: RollbackLevel = arg(words, 0, "rollback iteration|task|chain|session ...")?
        .parse()
        .map_err(|e| format!("{e}"))?;
    Ok(match level {
        RollbackLevel::Iteration => {
            let agent_id = arg(words, 1, "rollback iteration <agent-id> [n]")?.to_string();
            let iterations = match words.get(2) {
                Some(n) => n
                    .parse()
                    .map_err(|_| format!("invalid iteration count: {n}"))?,
                None => 1,
            };
            RollbackRequest::Iteration {
                agent_id,
                iterations,
            }
        }
        RollbackLevel::Task => {
            RollbackRequest::Task(arg(words, 1, "rollback task <task-id>")?.to_string())
        }
        RollbackLevel::TaskChain => {
            RollbackRequest::TaskChain(arg(words, 1, "rollback chain <task-id>")?.to_string())
        }
        RollbackLevel::Session => RollbackRequest::Session,
    })
}
