//! Inbox scanning.
//!
//! Recursively finds media files dropped into the configured inbox directory.
//! A file is only handed to ingest once it is stable: its size must be
//! unchanged between two consecutive polls, so files still being copied in
//! are left alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Extensions the inbox picks up (case-insensitive).
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "webm", "ts", "flv", "wmv", "mpg", "mpeg", "mp3", "m4a", "aac",
    "flac", "ogg", "opus", "wav", "jpg", "jpeg", "png", "gif", "webp", "pdf",
];

#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    Stable,
    Unstable { previous_size: u64, current_size: u64 },
    /// First time this file was seen.
    New,
}

pub fn is_supported_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lists supported files under `root`, skipping hidden files and directories.
pub fn scan_inbox(root: &Path) -> Vec<ScanCandidate> {
    if !root.exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name().to_str()));

    let mut candidates = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !is_supported_file(entry.path()) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            candidates.push(ScanCandidate {
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}

fn is_hidden(name: Option<&str>) -> bool {
    name.map(|n| n.starts_with('.')).unwrap_or(false)
}

pub fn compare_sizes(previous: Option<u64>, current_size: u64) -> StabilityResult {
    match previous {
        None => StabilityResult::New,
        Some(p) if p == current_size => StabilityResult::Stable,
        Some(previous_size) => StabilityResult::Unstable {
            previous_size,
            current_size,
        },
    }
}

/// Remembers sizes between polls.
#[derive(Debug)]
pub struct InboxWatcher {
    root: PathBuf,
    seen: HashMap<PathBuf, u64>,
}

impl InboxWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seen: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans once and returns the files that are ready for ingest. Returned
    /// files are forgotten, so a file that is not moved away is offered again
    /// only after it has been stable for another poll.
    pub fn poll(&mut self) -> Vec<ScanCandidate> {
        let found = scan_inbox(&self.root);
        let mut next = HashMap::with_capacity(found.len());
        let mut ready = Vec::new();

        for candidate in found {
            match compare_sizes(self.seen.get(&candidate.path).copied(), candidate.size_bytes) {
                StabilityResult::Stable if candidate.size_bytes > 0 => ready.push(candidate),
                StabilityResult::Unstable { previous_size, current_size } => {
                    tracing::debug!(
                        path = %candidate.path.display(),
                        previous_size,
                        current_size,
                        "inbox file still growing"
                    );
                    next.insert(candidate.path, candidate.size_bytes);
                }
                _ => {
                    next.insert(candidate.path, candidate.size_bytes);
                }
            }
        }
        self.seen = next;
        ready
    }
}
