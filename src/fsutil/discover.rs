//! Bounded breadth-first search for marker directories.
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    pub max_depth: usize,
    pub max_entries: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_entries: 100_000,
        }
    }
}

/// Result of a marker search.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Matches ordered shallowest first, then by the bytes of the path.
    pub matches: Vec<(usize, PathBuf)>,
    /// Set when a limit cut the walk short.
    pub truncated: bool,
    pub unreadable: Vec<PathBuf>,
}

impl Discovery {
    pub fn selected(&self) -> Option<&Path> {
        self.matches.first().map(|(_, path)| path.as_path())
    }

    pub fn others(&self) -> impl Iterator<Item = &Path> {
        self.matches.iter().skip(1).map(|(_, path)| path.as_path())
    }
}

/// Find directories under `root` whose names match one of `markers`
/// (ASCII case-insensitive).
///
/// Symlinks are never followed and matched directories are not descended
/// into. Unreadable directories are recorded and skipped.
pub fn find_marker_dirs(root: &Path, markers: &[&str], limits: WalkLimits) -> Discovery {
    let mut discovery = Discovery::default();
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    let mut visited = 0usize;

    while let Some((dir, depth)) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                discovery.unreadable.push(dir);
                continue;
            }
        };
        let mut children: Vec<_> = entries.filter_map(|entry| entry.ok()).collect();
        children.sort_by_key(|entry| entry.file_name());

        for entry in children {
            visited += 1;
            if visited > limits.max_entries {
                discovery.truncated = true;
                queue.clear();
                break;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child_depth = depth + 1;
            if markers.iter().any(|marker| name.eq_ignore_ascii_case(marker)) {
                discovery.matches.push((child_depth, entry.path()));
                continue;
            }
            if child_depth >= limits.max_depth {
                discovery.truncated = true;
                continue;
            }
            queue.push_back((entry.path(), child_depth));
        }
    }

    discovery.matches.sort_by(|(left_depth, left), (right_depth, right)| {
        left_depth.cmp(right_depth).then_with(|| {
            left.as_os_str()
                .as_encoded_bytes()
                .cmp(right.as_os_str().as_encoded_bytes())
        })
    });
    discovery
}
