use std::path::{Path, PathBuf};

/// Writes one Markdown file per completed step under
/// `.agent-relay/step-outputs/<run-id>/<step-name>.md`, containing the
/// cleaned (escape-stripped) output (§6).
pub fn write_step_output(base_dir: &Path, run_id: &str, step_id: &str, output: &str) -> std::io::Result<PathBuf> {
    let dir = base_dir
        .join(".agent-relay")
        .join("step-outputs")
        .join(run_id);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{step_id}.md"));
    std::fs::write(&path, output)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_markdown_file_under_the_expected_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_step_output(dir.path(), "run-1", "build", "the output").unwrap();
        assert!(path.ends_with(".agent-relay/step-outputs/run-1/build.md"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "the output");
    }
}
