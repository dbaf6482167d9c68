//! Shell file that defines the live aliases, meant to be sourced from the
//! user's shell rc file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sync_engine::{Alias, ArtifactSink, Error, Result};
use tracing::debug;

const HEADER: &str = "# Generated by alias-bridge. Edits are overwritten on the next sync.\n";

pub struct ShellScriptWriter {
    path: PathBuf,
}

impl ShellScriptWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_error(&self, source: std::io::Error) -> Error {
        Error::LocalPersist {
            path: self.path.clone(),
            source,
        }
    }
}

/// Renders `aliases` as `alias name='command'` lines ordered by name.
pub fn render(aliases: &[Alias]) -> String {
    let mut sorted: Vec<&Alias> = aliases.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::from(HEADER);
    for alias in sorted {
        if let Some(comment) = alias.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            for line in comment.lines() {
                out.push_str("# ");
                out.push_str(line.trim_end());
                out.push('\n');
            }
        }
        out.push_str(&format!("alias {}={}\n", alias.name, quote(&alias.command)));
    }
    out
}

/// Single-quotes `s` for POSIX shells. Embedded quotes become `'\''`.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
impl ArtifactSink for ShellScriptWriter {
    async fn regenerate(&self, aliases: &[Alias]) -> Result<()> {
        let script = render(aliases);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persist_error(e))?;
        }
        let tmp = self.path.with_extension("sh.tmp");
        tokio::fs::write(&tmp, script.as_bytes())
            .await
            .map_err(|e| self.persist_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.persist_error(e))?;
        debug!(path = %self.path.display(), count = aliases.len(), "shell aliases regenerated");
        Ok(())
    }
}
