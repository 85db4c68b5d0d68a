//! GitHub issue used as the plan for tasks validation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use crate::io::atomic::write_atomic;
use crate::io::process::run_command_with_timeout;

const GH_TIMEOUT: Duration = Duration::from_secs(60);
const GH_OUTPUT_LIMIT: usize = 1024 * 1024;

/// `owner/repo#number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl FromStr for IssueRef {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (repo_path, number) = value
            .split_once('#')
            .ok_or_else(|| anyhow!("invalid issue reference {value:?}: expected owner/repo#number"))?;
        let (owner, repo) = repo_path
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| anyhow!("invalid repo path {repo_path:?}: expected owner/repo"))?;
        let number: u64 = number
            .parse()
            .with_context(|| format!("invalid issue number {number:?}"))?;
        if number == 0 {
            bail!("issue number must be positive");
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// Title and body of the issue via `gh issue view`.
pub fn fetch_issue(issue: &IssueRef) -> Result<String> {
    let mut cmd = Command::new("gh");
    cmd.args(["issue", "view", &issue.number.to_string()])
        .args(["--repo", &format!("{}/{}", issue.owner, issue.repo)])
        .args(["--json", "title,body", "--jq", ".title + \"\\n\\n\" + .body"]);
    let output = run_command_with_timeout(cmd, GH_TIMEOUT, GH_OUTPUT_LIMIT)
        .with_context(|| format!("run gh issue view for {issue}"))?;
    if output.timed_out {
        bail!("gh issue view for {issue} timed out");
    }
    if !output.status.success() {
        bail!(
            "failed to fetch issue {issue}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let content = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if content.is_empty() {
        bail!("issue {issue} has no content");
    }
    Ok(content)
}

/// Path of the cached issue text, fetching it on first use.
pub fn cached_issue(issue: &IssueRef, cache_path: &Path) -> Result<PathBuf> {
    if cache_path.is_file() && !fs::read_to_string(cache_path)?.trim().is_empty() {
        return Ok(cache_path.to_path_buf());
    }
    let content = fetch_issue(issue)?;
    write_atomic(cache_path, &format!("{content}\n"))?;
    info!(%issue, path = %cache_path.display(), "issue cached");
    Ok(cache_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_references() {
        let issue: IssueRef = "acme/widgets#42".parse().unwrap();
        assert_eq!(issue.owner, "acme");
        assert_eq!(issue.repo, "widgets");
        assert_eq!(issue.number, 42);
        assert_eq!(issue.to_string(), "acme/widgets#42");
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in ["", "acme/widgets", "acme#1", "acme/widgets#x", "acme/widgets#0", "a/b/c#1"] {
            assert!(bad.parse::<IssueRef>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn cached_issue_is_not_refetched() {
        let temp = tempfile::tempdir().unwrap();
        let cache = temp.path().join("github-issue.md");
        fs::write(&cache, "Title\n\nBody\n").unwrap();
        let issue: IssueRef = "acme/widgets#1".parse().unwrap();
        assert_eq!(cached_issue(&issue, &cache).unwrap(), cache);
    }
}
