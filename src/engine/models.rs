use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub default_branch: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Fail,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }

    /// Terminal states permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Error)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub repo_id: i64,
    pub owner: String,
    pub repo_name: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub status: BuildStatus,
    pub logs: String,
    pub created_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Webhook,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
        }
    }
}

/// Request to start a build, regardless of origin. The optional branch
/// overrides the repository's default; whichever wins is snapshotted into
/// the build record so later registry edits never affect a run in flight.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub requested_by: String,
    pub source: TriggerSource,
}

/// Identity of a checkout directory. Keyed by branch as well as repo so two
/// branches of the same repository never share a working tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl WorkspaceKey {
    pub fn new(owner: &str, repo: &str, branch: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        }
    }

    /// Directory name for this key, safe for any filesystem: each component
    /// keeps only `[A-Za-z0-9._-]`, everything else becomes `-`.
    pub fn directory_name(&self) -> String {
        format!(
            "{}_{}_{}",
            sanitize(&self.owner),
            sanitize(&self.repo),
            sanitize(&self.branch)
        )
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// One external command: a program and its arguments, never a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Detected install/build command pair for a synchronized source tree.
/// A declared build step always implies a preceding install step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPlan {
    pub install: Option<CommandSpec>,
    pub build: Option<CommandSpec>,
}

impl BuildPlan {
    /// A plan with no steps: the build is skipped, not failed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.install.is_none() && self.build.is_none()
    }
}
