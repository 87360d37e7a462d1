//! Read-only access to the backend's per-project transcript directory.
//!
//! Layout: `<projects_dir>/<project_key>/<session-id>.jsonl`. Files are
//! appended by the backend process; this module never writes to them.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::session::Session;
use crate::core::transcript::{TranscriptEntry, session_from_entries};

const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Maps a working directory to its transcript directory name.
///
/// Every character that is not ASCII alphanumeric or `-` becomes `-`, so
/// `/home/me/my_app` maps to `-home-me-my-app`.
pub fn project_key(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    projects_dir: PathBuf,
}

impl SessionStore {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub fn project_dir(&self, project_key: &str) -> PathBuf {
        self.projects_dir.join(project_key)
    }

    /// Lists the sessions of one project, most recently modified file first.
    ///
    /// A missing project directory is an empty listing.
    pub fn list_sessions(&self, project_key: &str) -> Result<Vec<Session>> {
        let dir = self.project_dir(project_key);
        let mut sessions = Vec::new();
        for (path, _) in transcript_files(&dir)? {
            match load_session_file(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => debug!("Skipping transcript without entries: {}", path.display()),
                Err(e) => debug!("Skipping unreadable transcript {}: {e:#}", path.display()),
            }
        }
        Ok(sessions)
    }

    /// Finds a session by id in any project directory.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Ok(None);
        }
        let file_name = format!("{id}.{TRANSCRIPT_EXTENSION}");
        for project in self.project_keys()? {
            let path = self.project_dir(&project).join(&file_name);
            if path.is_file() {
                let session = load_session_file(&path)?.map(|mut session| {
                    session.metadata.project = Some(project);
                    session
                });
                return Ok(session);
            }
        }
        Ok(None)
    }

    /// Lists sessions across all projects, tagged with their project key and
    /// sorted by `updated_at`, newest first.
    pub fn list_all_sessions(&self) -> Result<Vec<Session>> {
        let mut all = Vec::new();
        for project in self.project_keys()? {
            let sessions = self.list_sessions(&project)?;
            all.extend(sessions.into_iter().map(|mut session| {
                session.metadata.project = Some(project.clone());
                session
            }));
        }
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    fn project_keys(&self) -> Result<Vec<String>> {
        if !self.projects_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.projects_dir).with_context(|| {
            format!(
                "Failed to read projects directory {}",
                self.projects_dir.display()
            )
        })? {
            let entry = entry.context("Failed to read directory entry")?;
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                keys.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Returns transcript files in `dir` with their mtime, newest first.
fn transcript_files(dir: &Path) -> Result<Vec<(PathBuf, Option<SystemTime>)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == TRANSCRIPT_EXTENSION) && path.is_file() {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            files.push((path, modified));
        }
    }

    files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(files)
}

/// Loads one transcript file. Returns `Ok(None)` when no line parses.
pub fn load_session_file(path: &Path) -> Result<Option<Session>> {
    let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
        return Ok(None);
    };

    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open transcript {}", path.display()))?;
    let file_time: DateTime<Utc> = file
        .metadata()
        .and_then(|m| m.modified())
        .map_or_else(|_| Utc::now(), DateTime::from);

    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for (index, line) in reader.split(b'\n').enumerate() {
        let line = line.context("Failed to read transcript line")?;
        let line = String::from_utf8_lossy(&line);
        if line.trim().is_empty() {
            continue;
        }
        match TranscriptEntry::parse(&line) {
            Some(entry) => entries.push(entry),
            None => debug!("Skipping malformed line {} in {}", index + 1, path.display()),
        }
    }

    Ok(session_from_entries(&id, &entries, file_time))
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::core::session::SessionStatus;

    fn write_transcript(dir: &Path, project: &str, id: &str, lines: &[&str]) -> PathBuf {
        let project_dir = dir.join(project);
        fs::create_dir_all(&project_dir).unwrap();
        let path = project_dir.join(format!("{id}.jsonl"));
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn project_key_replaces_separators() {
        assert_eq!(project_key(Path::new("/home/me/my_app")), "-home-me-my-app");
        assert_eq!(project_key(Path::new("/a-b/C.d")), "-a-b-C-d");
    }

    #[test]
    fn malformed_line_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write_transcript(
            tmp.path(),
            "p",
            "s1",
            &[
                r#"{"role":"user","content":"a","timestamp":"2025-01-01T00:00:00Z"}"#,
                r#"{"role":"assistant","content":"#,
                r#"{"role":"assistant","content":"c","timestamp":"2025-01-01T00:01:00Z"}"#,
            ],
        );

        let store = SessionStore::new(tmp.path());
        let sessions = store.list_sessions("p").unwrap();
        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.messages[1].content, "c");
    }

    #[test]
    fn files_without_entries_are_dropped() {
        let tmp = TempDir::new().unwrap();
        write_transcript(tmp.path(), "p", "empty", &[]);
        write_transcript(tmp.path(), "p", "junk", &["nope", "{broken"]);
        write_transcript(tmp.path(), "p", "ok", &[r#"{"role":"user","content":"hi"}"#]);

        let store = SessionStore::new(tmp.path());
        let ids: Vec<String> = store
            .list_sessions("p")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["ok"]);
    }

    #[test]
    fn listing_is_newest_file_first() {
        let tmp = TempDir::new().unwrap();
        let old = write_transcript(tmp.path(), "p", "old", &[r#"{"role":"user","content":"1"}"#]);
        let new = write_transcript(tmp.path(), "p", "new", &[r#"{"role":"user","content":"2"}"#]);
        set_mtime(&old, 1_000);
        set_mtime(&new, 2_000);

        let store = SessionStore::new(tmp.path());
        let ids: Vec<String> = store
            .list_sessions("p")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn missing_project_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("nowhere"));
        assert!(store.list_sessions("p").unwrap().is_empty());
        assert!(store.list_all_sessions().unwrap().is_empty());
        assert!(store.get_session("s1").unwrap().is_none());
    }

    #[test]
    fn get_session_searches_projects() {
        let tmp = TempDir::new().unwrap();
        write_transcript(tmp.path(), "p1", "a", &[r#"{"role":"user","content":"x"}"#]);
        write_transcript(tmp.path(), "p2", "b", &[r#"{"role":"user","content":"y"}"#]);

        let store = SessionStore::new(tmp.path());
        let session = store.get_session("b").unwrap().unwrap();
        assert_eq!(session.title, "y");
        assert_eq!(session.metadata.project.as_deref(), Some("p2"));
        assert!(store.get_session("missing").unwrap().is_none());
        assert!(store.get_session("../p1/a").unwrap().is_none());
    }

    #[test]
    fn cross_project_listing_tags_and_sorts() {
        let tmp = TempDir::new().unwrap();
        write_transcript(
            tmp.path(),
            "p1",
            "older",
            &[r#"{"role":"user","content":"x","timestamp":"2025-01-01T00:00:00Z"}"#],
        );
        write_transcript(
            tmp.path(),
            "p2",
            "newer",
            &[r#"{"role":"user","content":"y","timestamp":"2025-06-01T00:00:00Z"}"#],
        );

        let store = SessionStore::new(tmp.path());
        let all = store.list_all_sessions().unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
        assert_eq!(all[0].metadata.project.as_deref(), Some("p2"));
        assert_eq!(all[1].metadata.project.as_deref(), Some("p1"));
    }

    #[test]
    fn invalid_utf8_line_does_not_poison_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_transcript(tmp.path(), "p", "s", &[r#"{"role":"user","content":"ok"}"#]);
        let mut file = File::options().append(true).open(&path).unwrap();
        file.write_all(&[0xff, 0xfe, b'\n']).unwrap();

        let session = load_session_file(&path).unwrap().unwrap();
        assert_eq!(session.messages.len(), 1);
    }
}
