// ABOUTME: Project directory discovery that walks a root for version-controlled projects
// Prunes dependency directories and stops descending once a project marker is found

use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::models::DirectoryInfo;

const PRUNED_DIRS: &[&str] = &["node_modules"];

/// Walk `root` and collect candidate project directories.
///
/// A directory counts as a project when it carries a version-control
/// directory or a `.pogo.yaml` marker. Projects are not nested: the walk
/// does not descend past the first marker it finds.
pub fn scan_projects(root: &Path) -> Vec<DirectoryInfo> {
    let mut directories = Vec::new();

    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if PRUNED_DIRS.iter().any(|pruned| name == *pruned) {
            walker.skip_current_dir();
            continue;
        }

        if is_project_dir(entry.path()) {
            directories.push(DirectoryInfo {
                name: display_name(root, entry.path()),
                path: entry.path().to_string_lossy().into_owned(),
            });
            walker.skip_current_dir();
        }
    }

    directories
}

fn is_project_dir(path: &Path) -> bool {
    path.join(".git").is_dir() || path.join(".hg").is_dir() || path.join(".pogo.yaml").is_file()
}

fn display_name(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        // The root itself is a project; fall back to its directory name.
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn mkproject(root: &Path, rel: &str, marker: &str) {
        let dir = root.join(rel);
        fs::create_dir_all(dir.join(marker)).unwrap();
    }

    #[test]
    fn finds_projects_by_marker_directories() {
        let tmp = tempfile::tempdir().unwrap();
        mkproject(tmp.path(), "alpha", ".git");
        mkproject(tmp.path(), "nested/beta", ".hg");
        fs::create_dir_all(tmp.path().join("plain")).unwrap();

        let mut found = scan_projects(tmp.path());
        found.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "nested/beta"]);
    }

    #[test]
    fn does_not_descend_into_pruned_or_project_directories() {
        let tmp = tempfile::tempdir().unwrap();
        mkproject(tmp.path(), "outer", ".git");
        // A nested repository below an already-found project must not appear.
        mkproject(tmp.path(), "outer/vendor", ".git");
        mkproject(tmp.path(), "node_modules/dep", ".git");

        let found = scan_projects(tmp.path());
        let names: Vec<_> = found.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["outer"]);
    }

    #[test]
    fn yaml_marker_counts_as_a_project() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("configured");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".pogo.yaml"), "{}\n").unwrap();

        let found = scan_projects(tmp.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "configured");
    }

    #[test]
    fn root_that_is_itself_a_project_uses_its_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("myrepo");
        fs::create_dir_all(root.join(".git")).unwrap();

        let found = scan_projects(&root);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "myrepo");
    }
}
