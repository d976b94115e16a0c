// History file browsing for the danmuhub CLI
//
// Resolves file arguments against the history directory and renders one
// envelope per line.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use danmuhub_core::history::HistoryLog;
use danmuhub_core::{AppCommand, Command, Envelope};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Resolve a `history show/delete` argument.
///
/// No argument means the newest file. A bare name is looked up in `dir`.
pub fn resolve_file(dir: &Path, arg: Option<&str>) -> Result<PathBuf> {
    match arg {
        None => HistoryLog::list(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .into_iter()
            .next()
            .with_context(|| format!("No history files in {}", dir.display())),
        Some(arg) => {
            let direct = PathBuf::from(arg);
            if direct.is_file() {
                return Ok(direct);
            }
            let in_dir = dir.join(arg);
            if in_dir.is_file() {
                return Ok(in_dir);
            }
            bail!("History file not found: {}", arg)
        }
    }
}

pub fn formatted_time(envelope: &Envelope) -> String {
    let dt = DateTime::from_timestamp_millis(envelope.timestamp).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Short human-readable summary of a command.
pub fn summary(command: &Command) -> String {
    match command {
        Command::App(AppCommand::StatusUpdate(update)) => match &update.detail {
            Some(detail) => format!("{} ({})", update.status, detail),
            None => update.status.to_string(),
        },
        Command::App(AppCommand::ActivityUpdate { activity }) => format!("activity {}", activity),
        Command::App(AppCommand::JoinResponse { code }) => format!("join code {}", code),
        Command::App(AppCommand::ErrorMessage(report)) => report.reason.clone(),
        Command::App(app) => app.kind().to_string(),
        Command::Upstream(value) => upstream_summary(value),
    }
}

fn upstream_summary(value: &Value) -> String {
    let kind = value["cmd"].as_str().unwrap_or("?");
    let base = kind.split(':').next().unwrap_or(kind);
    let data = &value["data"];

    match base {
        "DANMU_MSG" => format!(
            "{}: {}",
            value["info"][2][1].as_str().unwrap_or("?"),
            value["info"][1].as_str().unwrap_or("")
        ),
        "SEND_GIFT" | "COMBO_SEND" => format!(
            "{} sent {} x{}",
            data["uname"].as_str().unwrap_or("?"),
            data["giftName"]
                .as_str()
                .or_else(|| data["gift_name"].as_str())
                .unwrap_or("?"),
            data["num"]
                .as_u64()
                .or_else(|| data["total_num"].as_u64())
                .unwrap_or(1)
        ),
        "SUPER_CHAT_MESSAGE" => format!(
            "{} ¥{}: {}",
            data["user_info"]["uname"].as_str().unwrap_or("?"),
            data["price"].as_u64().unwrap_or(0),
            data["message"].as_str().unwrap_or("")
        ),
        "GUARD_BUY" => format!(
            "{} bought {}",
            data["username"].as_str().unwrap_or("?"),
            data["gift_name"].as_str().unwrap_or("guard")
        ),
        "INTERACT_WORD" => format!("{} entered", data["uname"].as_str().unwrap_or("?")),
        _ => kind.to_string(),
    }
}
