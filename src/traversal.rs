// Stateless between calls: the previously returned file is the only
// resumption token. Siblings are ordered by file name, so the walk resumes
// correctly even if the cursor was removed in the meantime.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::worker::CancelToken;

pub struct BatchTraversal {
    root: PathBuf,
    cancel: Option<CancelToken>,
}

impl BatchTraversal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn next<F>(&self, cursor: Option<&Path>, mut accept: F) -> Option<PathBuf>
    where
        F: FnMut(&Path) -> bool,
    {
        let mut listings = Listings::default();
        let mut chain: Vec<PathBuf> = Vec::new();

        let mut pointer = match cursor {
            None => listings.first_child(&self.root),
            Some(cursor) if cursor == self.root => listings.first_child(&self.root),
            Some(cursor) => {
                if !cursor.starts_with(&self.root) {
                    warn!(cursor = %cursor.display(), root = %self.root.display(), "cursor outside root");
                    return None;
                }
                let mut ancestors: Vec<PathBuf> = cursor
                    .ancestors()
                    .skip(1)
                    .take_while(|ancestor| *ancestor != self.root)
                    .map(Path::to_path_buf)
                    .collect();
                ancestors.reverse();
                chain = ancestors;
                listings.next_sibling(cursor)
            }
        };

        loop {
            if self.is_cancelled() {
                debug!("walk cancelled");
                return None;
            }
            match pointer.take() {
                Some(entry) => match entry_kind(&entry) {
                    EntryKind::Directory => {
                        pointer = listings.first_child(&entry);
                        chain.push(entry);
                    }
                    EntryKind::File => {
                        if accept(&entry) {
                            return Some(entry);
                        }
                        pointer = listings.next_sibling(&entry);
                    }
                    EntryKind::Other => {
                        pointer = listings.next_sibling(&entry);
                    }
                },
                None => {
                    let directory = chain.pop()?;
                    pointer = listings.next_sibling(&directory);
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }
}

enum EntryKind {
    Directory,
    File,
    Other,
}

/// Real directories are descended; symlinks count as files only when they
/// point at one, so linked directories can never form a cycle.
fn entry_kind(path: &Path) -> EntryKind {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return EntryKind::Other;
    };
    let file_type = meta.file_type();
    if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() && path.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

#[derive(Default)]
struct Listings {
    by_dir: HashMap<PathBuf, Vec<OsString>>,
}

impl Listings {
    fn children(&mut self, dir: &Path) -> &[OsString] {
        self.by_dir.entry(dir.to_path_buf()).or_insert_with(|| {
            // Unreadable directories have no children.
            let mut names: Vec<OsString> = match fs::read_dir(dir) {
                Ok(entries) => entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name())
                    .collect(),
                Err(err) => {
                    debug!(dir = %dir.display(), error = %err, "directory skipped");
                    Vec::new()
                }
            };
            names.sort();
            names
        })
    }

    fn first_child(&mut self, dir: &Path) -> Option<PathBuf> {
        self.children(dir).first().map(|name| dir.join(name))
    }

    fn next_sibling(&mut self, entry: &Path) -> Option<PathBuf> {
        let parent = entry.parent()?;
        let name = entry.file_name()?;
        let siblings = self.children(parent);
        let index = siblings.partition_point(|sibling| sibling.as_os_str() <= name);
        siblings.get(index).map(|sibling| parent.join(sibling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn empty_root_yields_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let walk = BatchTraversal::new(temp.path());
        assert!(walk.next(None, |_| true).is_none());
    }

    #[test]
    fn skips_empty_directories() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("a/empty")).unwrap();
        touch(temp.path(), "b.txt");
        let walk = BatchTraversal::new(temp.path());
        let first = walk.next(None, |_| true).unwrap();
        assert_eq!(first, temp.path().join("b.txt"));
        assert!(walk.next(Some(&first), |_| true).is_none());
    }

    #[test]
    fn resumes_after_removed_cursor() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "a/1");
        touch(temp.path(), "a/2");
        touch(temp.path(), "a/3");
        let walk = BatchTraversal::new(temp.path());
        let first = walk.next(None, |_| true).unwrap();
        fs::remove_file(&first).unwrap();
        let second = walk.next(Some(&first), |_| true).unwrap();
        assert_eq!(second, temp.path().join("a/2"));
    }

    #[test]
    fn cancelled_walk_stops() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "a");
        let token = CancelToken::new();
        token.cancel();
        let walk = BatchTraversal::new(temp.path()).with_cancel(token);
        assert!(walk.next(None, |_| true).is_none());
    }
}
