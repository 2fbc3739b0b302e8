use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

/// Identity of the session a log file belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey {
    pub session_id: String,
    pub project: String,
}

impl SessionKey {
    /// `<projects>/<-home-me-repo>/<id>.jsonl` maps to session `<id>` in project
    /// `/home/me/repo`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let session_id = path.file_stem()?.to_str()?.to_string();
        if session_id.is_empty() {
            return None;
        }
        let project = path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .map(project_display_name)
            .unwrap_or_default();
        Some(Self {
            session_id,
            project,
        })
    }
}

pub fn project_display_name(dir_name: &str) -> String {
    dir_name.replace('-', "/")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProcessingCursor {
    #[default]
    Unprocessed,
    /// Imported in full during scan `scan`; `offset` is where tailing resumes.
    FullyProcessed { scan: u64, offset: u64 },
    /// Tailed up to `offset`.
    Offset(u64),
}

impl ProcessingCursor {
    pub fn offset(self) -> u64 {
        match self {
            Self::Unprocessed => 0,
            Self::FullyProcessed { offset, .. } => offset,
            Self::Offset(offset) => offset,
        }
    }

    pub fn is_fully_processed(self) -> bool {
        matches!(self, Self::FullyProcessed { .. })
    }
}

/// Cumulative counts for one file across every import and tail pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileTotals {
    pub messages: u64,
    pub tool_uses: u64,
    pub decode_errors: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileProgress {
    pub session_id: Option<String>,
    pub cursor: ProcessingCursor,
    pub totals: FileTotals,
}

/// Per-file progress, keyed by path.
#[derive(Debug, Default)]
pub struct SessionTracker {
    files: HashMap<PathBuf, FileProgress>,
}

impl SessionTracker {
    pub fn with_progress(entries: impl IntoIterator<Item = (PathBuf, FileProgress)>) -> Self {
        Self {
            files: entries.into_iter().collect(),
        }
    }

    pub fn progress(&self, path: &Path) -> FileProgress {
        self.files.get(path).cloned().unwrap_or_default()
    }

    pub fn update(&mut self, path: &Path, progress: FileProgress) {
        self.files.insert(path.to_path_buf(), progress);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_session_and_project_from_path() {
        let key = SessionKey::from_path(Path::new(
            "/home/me/.claude/projects/-home-me-code-app/0b7c-11ee.jsonl",
        ))
        .unwrap();
        assert_eq!(key.session_id, "0b7c-11ee");
        assert_eq!(key.project, "/home/me/code/app");
    }

    #[test]
    fn path_without_stem_has_no_session() {
        assert!(SessionKey::from_path(Path::new("/")).is_none());
    }

    #[test]
    fn cursor_offsets() {
        assert_eq!(ProcessingCursor::Unprocessed.offset(), 0);
        let full = ProcessingCursor::FullyProcessed { scan: 2, offset: 40 };
        assert_eq!(full.offset(), 40);
        assert!(full.is_fully_processed());
        assert!(!ProcessingCursor::Offset(7).is_fully_processed());
    }

    #[test]
    fn unknown_paths_start_unprocessed() {
        let mut tracker = SessionTracker::default();
        let path = Path::new("/p/s.jsonl");
        assert_eq!(tracker.progress(path), FileProgress::default());

        tracker.update(
            path,
            FileProgress {
                session_id: Some("s".to_string()),
                cursor: ProcessingCursor::Offset(12),
                totals: FileTotals {
                    messages: 1,
                    ..FileTotals::default()
                },
            },
        );
        assert_eq!(tracker.progress(path).cursor.offset(), 12);
        assert_eq!(tracker.len(), 1);
    }
}
