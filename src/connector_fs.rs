//! Input discovery.
//!
//! Lists the files directly inside `paths.input_dir` whose names match
//! `paths.include_globs`, sorted by file name so runs process inputs in a
//! stable order.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::PathsConfig;

pub fn discover_inputs(paths: &PathsConfig) -> Result<Vec<PathBuf>> {
    let root = &paths.input_dir;
    if !root.is_dir() {
        bail!("Input directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&paths.include_globs)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).max_depth(1);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        // Skip hidden files, including our own in-flight temp files.
        if name.starts_with('.') || !include_set.is_match(name.as_ref()) {
            continue;
        }
        files.push(entry.into_path());
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(root: &std::path::Path) -> PathsConfig {
        PathsConfig {
            input_dir: root.to_path_buf(),
            output_dir: root.join("out"),
            progress_file: root.join("progress.json"),
            status_file: root.join("status.json"),
            include_globs: vec!["*.parquet".to_string()],
        }
    }

    #[test]
    fn lists_matching_files_sorted_and_flat() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.parquet", "a.parquet", "notes.txt", ".a.parquet.tmp", ".hidden.parquet"] {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        fs::create_dir(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested/c.parquet"), b"x").unwrap();

        let found = discover_inputs(&paths(tmp.path())).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.parquet", "b.parquet"]);
    }

    #[test]
    fn missing_input_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut p = paths(tmp.path());
        p.input_dir = tmp.path().join("nope");
        assert!(discover_inputs(&p).is_err());
    }
}
