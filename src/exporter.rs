/// Rule include-file writer
///
/// Rewrites the whole rule file from the stored rule set: a header comment
/// block, then each rule's SecRule line separated by blank lines. The content
/// goes to a temp file next to the target and is renamed into place, so the
/// WAF never includes a half-written file.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::StoredRule;

pub const RULE_FILE_HEADER: &str = "\
# ==================================================
#  Auto-generated ModSecurity Rules (rule-miner)
# ==================================================
";

#[derive(Debug, Clone)]
pub struct RuleFileExporter {
    output_dir: PathBuf,
    file_name: String,
}

impl RuleFileExporter {
    pub fn new(output_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            file_name: file_name.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }

    /// Write every rule; an empty rule set leaves any existing file untouched
    pub async fn export(&self, rules: &[StoredRule]) -> Result<Option<PathBuf>> {
        if rules.is_empty() {
            debug!("No stored rules, skipping rule file export");
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create rule directory {}", self.output_dir.display()))?;

        let path = self.path();
        let tmp = self.output_dir.join(format!(".{}.tmp", self.file_name));
        tokio::fs::write(&tmp, render(rules))
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move rule file into {}", path.display()))?;

        info!("📝 Wrote {} rules to {}", rules.len(), path.display());
        Ok(Some(path))
    }
}

pub fn render(rules: &[StoredRule]) -> String {
    let mut out = String::with_capacity(
        RULE_FILE_HEADER.len() + rules.iter().map(|r| r.secrule_text.len() + 2).sum::<usize>() + 1,
    );
    out.push_str(RULE_FILE_HEADER);
    out.push('\n');
    for rule in rules {
        out.push_str(&rule.secrule_text);
        out.push_str("\n\n");
    }
    out
}

/// Whether `path` already holds exactly what `render` would produce
pub async fn is_current(path: &Path, rules: &[StoredRule]) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(existing) => existing == render(rules),
        Err(_) => false,
    }
}
