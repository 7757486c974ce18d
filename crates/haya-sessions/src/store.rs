//! Append-only JSONL session store.
//!
//! One file per session under the base directory. Line 1 is the metadata
//! entry; every following line is a message entry in append order. Appends
//! are single O_APPEND writes of a full line, serialized per session id, so
//! concurrent writers may interleave whole lines but never partial ones.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::{debug, info};

use haya_core::Message;

use crate::error::{Result, SessionError};
use crate::types::{SessionEntry, SessionListItem, SessionMeta};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    pub max_age_days: Option<u64>,
    pub max_size_mb: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub deleted_count: usize,
    pub freed_bytes: u64,
}

/// Exclusive owner of the on-disk session files.
pub struct SessionStore {
    base_dir: PathBuf,
    /// One append lock per session id — distinct sessions never contend.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        fs::set_permissions(&base_dir, fs::Permissions::from_mode(DIR_MODE))?;
        Ok(Self {
            base_dir,
            locks: DashMap::new(),
        })
    }

    /// The only path-traversal defense: the id must be `[A-Za-z0-9_-]+` and
    /// is never concatenated with user-controlled path segments elsewhere.
    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.jsonl"))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Self::validate_id(id)?;
        Ok(self.path_for(id).exists())
    }

    /// Create a new session file with its metadata line. A no-op if the
    /// session already exists.
    pub fn create(&self, id: &str, meta: Option<SessionMeta>) -> Result<()> {
        Self::validate_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();

        let path = self.path_for(id);
        if path.exists() {
            return Ok(());
        }
        let meta = meta.unwrap_or_else(|| SessionMeta::new(None, None));
        let line = serde_json::to_string(&SessionEntry::Meta(meta))?;
        write_line(&path, &line)?;
        debug!(session = id, "session created");
        Ok(())
    }

    /// Append one message as a single line. Creates the session on first use.
    pub fn append_message(&self, id: &str, msg: &Message) -> Result<()> {
        Self::validate_id(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap();

        let path = self.path_for(id);
        if !path.exists() {
            let meta = SessionMeta::new(None, None);
            write_line(&path, &serde_json::to_string(&SessionEntry::Meta(meta))?)?;
        }
        let line = serde_json::to_string(&SessionEntry::Message(msg.clone()))?;
        write_line(&path, &line)?;
        Ok(())
    }

    /// Read every entry including the leading metadata record.
    pub fn read_entries(&self, id: &str) -> Result<Vec<SessionEntry>> {
        Self::validate_id(id)?;
        let path = self.path_for(id);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        parse_entries(id, &raw)
    }

    /// Read only the message entries, in append order.
    pub fn read_messages(&self, id: &str) -> Result<Vec<Message>> {
        Ok(self
            .read_entries(id)?
            .into_iter()
            .filter_map(|e| match e {
                SessionEntry::Message(m) => Some(m),
                SessionEntry::Meta(_) => None,
            })
            .collect())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        Self::validate_id(id)?;
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.locks.remove(id);
                info!(session = id, "session deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Derived listing over every session file, newest update first.
    pub fn list(&self) -> Result<Vec<SessionListItem>> {
        let mut items = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = session_id_of(&path) else { continue };
            let raw = fs::read_to_string(&path)?;
            let entries = parse_entries(&id, &raw)?;

            let mut created_at = 0i64;
            let mut title = None;
            let mut updated_at = 0i64;
            let mut message_count = 0usize;
            for e in &entries {
                match e {
                    SessionEntry::Meta(m) => {
                        created_at = m.created_at;
                        title = m.title.clone();
                        updated_at = updated_at.max(m.created_at);
                    }
                    SessionEntry::Message(m) => {
                        message_count += 1;
                        updated_at = updated_at.max(m.timestamp);
                    }
                }
            }
            items.push(SessionListItem {
                id,
                title,
                created_at,
                updated_at,
                message_count,
            });
        }
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    /// Apply age-based deletion first, then size-based deletion oldest-first
    /// until total bytes fit under the cap.
    pub fn prune(&self, opts: PruneOptions) -> Result<PruneStats> {
        let mut stats = PruneStats::default();
        let now = SystemTime::now();

        let mut files: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if session_id_of(&path).is_none() {
                continue;
            }
            let md = entry.metadata()?;
            files.push((path, md.modified()?, md.len()));
        }

        if let Some(days) = opts.max_age_days {
            let cutoff = std::time::Duration::from_secs(days * 86_400);
            files.retain(|(path, mtime, len)| {
                let expired = now
                    .duration_since(*mtime)
                    .map(|age| age > cutoff)
                    .unwrap_or(false);
                if expired {
                    if fs::remove_file(path).is_ok() {
                        stats.deleted_count += 1;
                        stats.freed_bytes += len;
                    }
                    false
                } else {
                    true
                }
            });
        }

        if let Some(mb) = opts.max_size_mb {
            let limit = mb * 1024 * 1024;
            let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
            if total > limit {
                files.sort_by_key(|(_, mtime, _)| *mtime);
                for (path, _, len) in &files {
                    if total <= limit {
                        break;
                    }
                    if fs::remove_file(path).is_ok() {
                        stats.deleted_count += 1;
                        stats.freed_bytes += len;
                        total -= len;
                    }
                }
            }
        }

        if stats.deleted_count > 0 {
            info!(
                deleted = stats.deleted_count,
                freed_bytes = stats.freed_bytes,
                "sessions pruned"
            );
        }
        Ok(stats)
    }
}

fn session_id_of(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "jsonl" {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}

fn write_line(path: &Path, line: &str) -> Result<()> {
    let existed = path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existed {
        file.set_permissions(fs::Permissions::from_mode(FILE_MODE))?;
    }
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf)?;
    Ok(())
}

fn parse_entries(id: &str, raw: &str) -> Result<Vec<SessionEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: SessionEntry =
            serde_json::from_str(line).map_err(|_| SessionError::Corrupt {
                session: id.to_string(),
                line: idx + 1,
            })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haya_core::{Message, ToolCall};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_then_read_round_trips() {
        let (_dir, store) = store();
        store.create("abc", None).unwrap();
        let msgs = vec![
            Message::user("hi"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall {
                    id: "t1".into(),
                    name: "echo".into(),
                    arguments: "{}".into(),
                }],
            ),
            Message::tool_result("t1", "hi"),
        ];
        for m in &msgs {
            store.append_message("abc", m).unwrap();
        }
        let back = store.read_messages("abc").unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].content, "hi");
        assert_eq!(back[2].tool_call_id.as_deref(), Some("t1"));
    }

    #[test]
    fn first_entry_is_metadata() {
        let (_dir, store) = store();
        store.append_message("fresh", &Message::user("x")).unwrap();
        let entries = store.read_entries("fresh").unwrap();
        assert!(matches!(entries[0], SessionEntry::Meta(_)));
    }

    #[test]
    fn traversal_ids_rejected_before_any_file_operation() {
        let (_dir, store) = store();
        for bad in ["../etc/passwd", "a/b", "a:b", "", "a b", "ä"] {
            assert!(matches!(
                store.create(bad, None),
                Err(SessionError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn read_missing_session_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_messages("nope"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_line_reports_line_number() {
        let (_dir, store) = store();
        store.create("bad", None).unwrap();
        store.append_message("bad", &Message::user("ok")).unwrap();
        let path = store.path_for("bad");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n");
        fs::write(&path, raw).unwrap();

        match store.read_entries("bad") {
            Err(SessionError::Corrupt { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn list_derives_counts_and_titles() {
        let (_dir, store) = store();
        store
            .create("s1", Some(SessionMeta::new(Some("First".into()), None)))
            .unwrap();
        store.append_message("s1", &Message::user("a")).unwrap();
        store.append_message("s1", &Message::assistant("b")).unwrap();

        let items = store.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("First"));
        assert_eq!(items[0].message_count, 2);
        assert!(items[0].updated_at >= items[0].created_at);
    }

    #[test]
    fn prune_by_age_removes_only_stale_files() {
        let (_dir, store) = store();
        store.create("old", None).unwrap();
        store.create("new", None).unwrap();

        // Backdate the old file's mtime by ~365 days.
        let old_path = store.path_for("old");
        let past = SystemTime::now() - std::time::Duration::from_secs(365 * 86_400);
        let ft = fs::File::options().append(true).open(&old_path).unwrap();
        ft.set_times(fs::FileTimes::new().set_modified(past)).unwrap();

        let stats = store
            .prune(PruneOptions {
                max_age_days: Some(30),
                max_size_mb: None,
            })
            .unwrap();
        assert_eq!(stats.deleted_count, 1);
        assert!(!old_path.exists());
        assert!(store.exists("new").unwrap());
    }

    #[test]
    fn prune_by_size_deletes_oldest_first() {
        let (_dir, store) = store();
        for id in ["a", "b", "c"] {
            store.create(id, None).unwrap();
            let big = "x".repeat(512 * 1024);
            store.append_message(id, &Message::user(big)).unwrap();
        }
        // Make "a" the oldest.
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = fs::File::options().append(true).open(store.path_for("a")).unwrap();
        f.set_times(fs::FileTimes::new().set_modified(past)).unwrap();

        let stats = store
            .prune(PruneOptions {
                max_age_days: None,
                max_size_mb: Some(1),
            })
            .unwrap();
        assert!(stats.deleted_count >= 1);
        assert!(!store.exists("a").unwrap());
    }

    #[test]
    fn permissions_are_restrictive() {
        let (_dir, store) = store();
        store.create("perm", None).unwrap();
        let mode = fs::metadata(store.path_for("perm")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_MODE);
        let dir_mode = fs::metadata(&store.base_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
    }
}
