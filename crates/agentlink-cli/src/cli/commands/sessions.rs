//! Session command handlers.

use std::path::Path;

use agentlink_core::config::Config;
use agentlink_core::core::session::Session;
use agentlink_core::core::session_store::project_key;
use agentlink_core::core::transcript;
use anyhow::{Context, Result};
use chrono::Local;

use super::resolve_root;

pub fn list(root: &Path, all: bool, config: &Config) -> Result<()> {
    let store = config.session_store();
    let sessions = if all {
        store.list_all_sessions().context("list sessions")?
    } else {
        let root = resolve_root(root)?;
        store
            .list_sessions(&project_key(&root))
            .context("list sessions")?
    };

    if sessions.is_empty() {
        println!("No sessions found.");
    } else {
        for session in &sessions {
            println!("{}", format_row(session, all));
        }
    }
    Ok(())
}

pub fn show(id: &str, config: &Config) -> Result<()> {
    let session = config
        .session_store()
        .get_session(id)
        .with_context(|| format!("load session '{id}'"))?;
    match session {
        Some(session) if !session.messages.is_empty() => {
            println!("{}", transcript::format_transcript(&session));
        }
        _ => println!("Session '{id}' is empty or not found."),
    }
    Ok(())
}

fn format_row(session: &Session, with_project: bool) -> String {
    let updated = session
        .updated_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M");
    let mut row = format!(
        "{}  {}  {}  {}  {} msgs",
        session.title,
        session.id,
        updated,
        session.status,
        session.messages.len()
    );
    if with_project && let Some(project) = &session.metadata.project {
        row.push_str("  ");
        row.push_str(project);
    }
    row
}
