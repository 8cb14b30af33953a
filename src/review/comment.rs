use super::backend::ReviewOutcome;

const FOOTER: &str = "---\n*Powered by Patchwork AI*";

/// Render the aggregated review as a single PR-level Markdown comment, one
/// collapsible block per file with its severity counts.
pub fn format_review_comment(outcomes: &[ReviewOutcome]) -> String {
    let mut md = String::from("## 🤖 Patchwork Code Review\n\n");

    for outcome in outcomes {
        md.push_str(&format!(
            "<details>\n<summary><strong>📄 {}</strong></summary>\n\n",
            outcome.filename
        ));

        if outcome.counts.total() == 0 {
            md.push_str("No issues found.\n");
        } else {
            md.push_str(&format!("- 🔴 Critical: {}\n", outcome.counts.critical));
            md.push_str(&format!("- 🟠 High: {}\n", outcome.counts.high));
            md.push_str(&format!("- 🟡 Medium: {}\n", outcome.counts.medium));
            md.push_str(&format!("- 🟢 Low: {}\n", outcome.counts.low));
        }

        let narrative = outcome.raw_text.trim();
        if !narrative.is_empty() {
            md.push('\n');
            md.push_str(narrative);
            md.push('\n');
        }

        md.push_str("\n</details>\n\n");
    }

    md.push_str(FOOTER);
    md
}

/// Render the autofix summary: which files were rewritten and the short form
/// of the commit that carries them.
pub fn format_autofix_comment(fixed_files: &[String], commit_sha: &str) -> String {
    let mut md = format!(
        "## 🛠️ Patchwork Auto-Fix\n\nApplied fixes to **{} file(s)** in commit `{}`.\n\n### Changes\n",
        fixed_files.len(),
        short_sha(commit_sha)
    );
    for filename in fixed_files {
        md.push_str(&format!("- ✅ Rewrote `{filename}`\n"));
    }
    md.push('\n');
    md.push_str(FOOTER);
    md
}

/// First seven hex characters, the conventional short commit id.
pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
