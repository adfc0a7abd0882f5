use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

const ARCHIVE_EXTENSIONS: [&str; 4] = ["jar", "war", "rar", "zip"];

/// Every archive under `base_path`, sorted so the result can be used as a
/// deterministic classpath order.
pub fn scan_archives(base_path: &Path) -> Result<Vec<PathBuf>> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if is_archive(path) && path.is_file() {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut archives: Vec<PathBuf> = rx.iter().collect();
    archives.sort();
    Ok(archives)
}

/// Class files below a directory container as `(relative entry name, path)`,
/// sorted by entry name.
pub fn class_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let walker = WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .build();

    let mut out = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if is_class_entry(&name) {
            out.push((name, path.to_path_buf()));
        }
    }
    out.sort();
    Ok(out)
}

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ARCHIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Whether an archive or directory entry holds a type worth decoding.
/// Module and package descriptors and multi-release variants are skipped.
pub fn is_class_entry(name: &str) -> bool {
    if !name.ends_with(".class") || name.starts_with("META-INF/") {
        return false;
    }
    let file = name.rsplit('/').next().unwrap_or(name);
    file != "module-info.class" && file != "package-info.class"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn class_entry_filter() {
        assert!(is_class_entry("org/example/A.class"));
        assert!(is_class_entry("A$1.class"));
        assert!(!is_class_entry("module-info.class"));
        assert!(!is_class_entry("org/example/package-info.class"));
        assert!(!is_class_entry("META-INF/versions/11/org/example/A.class"));
        assert!(!is_class_entry("org/example/A.java"));
    }

    #[test]
    fn class_files_are_relative_and_sorted() {
        let base = temp_dir("annocache-scan-classes");
        fs::create_dir_all(base.join("org/b")).unwrap();
        fs::create_dir_all(base.join("org/a")).unwrap();
        fs::write(base.join("org/b/Z.class"), b"x").unwrap();
        fs::write(base.join("org/a/Y.class"), b"x").unwrap();
        fs::write(base.join("org/a/notes.txt"), b"x").unwrap();

        let found = class_files(&base).unwrap();
        let names: Vec<_> = found.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["org/a/Y.class", "org/b/Z.class"]);

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn scan_archives_finds_jars_in_order() {
        let base = temp_dir("annocache-scan-archives");
        fs::create_dir_all(base.join("lib/nested")).unwrap();
        fs::write(base.join("lib/b.jar"), b"x").unwrap();
        fs::write(base.join("lib/nested/a.jar"), b"x").unwrap();
        fs::write(base.join("lib/readme.md"), b"x").unwrap();

        let found = scan_archives(&base).unwrap();
        assert_eq!(found, vec![base.join("lib/b.jar"), base.join("lib/nested/a.jar")]);

        let _ = fs::remove_dir_all(base);
    }
}
