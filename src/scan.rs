use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use walkdir::WalkDir;

use crate::source::LocalFileHandle;

const IGNORE_FILE: &str = ".vaultignore";

const DEFAULT_IGNORE_LINES: &[&str] = &[
    IGNORE_FILE,
    // spool and partial downloads
    "*.enc",
    "vault-upload-*",
    "**/.*.tmp-*",
    "**/*.tmp-*",
    "*.tmp",
    "*.part",
    "*.crdownload",
    // sidecars
    "*.xmp",
    "*.aae",
    // VCS/IDE
    ".git",
    ".vscode",
    ".idea",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "._*",
    ".Trashes",
    ".Spotlight-V100/",
    "@eaDir/",
];

/// Gitignore-style filter applied to directory scans.
#[derive(Clone)]
pub struct IgnoreList {
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl IgnoreList {
    /// Defaults, then `extra` lines from config, then `<base_dir>/.vaultignore`.
    pub fn load(base_dir: &Path, extra: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }
        for line in extra {
            builder
                .add_line(None, line)
                .with_context(|| format!("add config ignore line: {line}"))?;
        }

        let ignore_path = base_dir.join(IGNORE_FILE);
        if ignore_path.exists() {
            for line in read_ignore_file(&ignore_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add {IGNORE_FILE} line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_ignore_rel(rel, is_dir)
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

/// Expands files and directories into handles, depth first in name order.
/// Directories are walked recursively and filtered through their own
/// [`IgnoreList`]; explicitly named files are always kept.
pub fn collect_files(paths: &[PathBuf], extra_ignores: &[String]) -> Result<Vec<LocalFileHandle>> {
    let mut out = Vec::new();
    for path in paths {
        let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        if meta.is_file() {
            out.push(LocalFileHandle::from_path(path)?);
            continue;
        }

        let ignore = IgnoreList::load(path, extra_ignores)?;
        let walker = WalkDir::new(path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !ignore.should_ignore_abs(e.path(), e.file_type().is_dir())
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            out.push(LocalFileHandle::from_path(entry.path())?);
        }
    }
    Ok(out)
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
