//! Build tool detection.
//!
//! Inspects the root of a synchronized tree and decides whether a build
//! procedure applies. A missing or unparsable `package.json` yields an empty
//! plan: the build is skipped, not failed. A declared `scripts.build`
//! yields a build step, which always implies a preceding install step.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::models::{BuildPlan, CommandSpec};

/// Detection result: the plan plus a human-readable note for the build log.
#[derive(Debug)]
pub struct Detection {
    pub plan: BuildPlan,
    pub transcript: String,
}

/// Narrow view of `package.json`; everything but `scripts` is ignored.
#[derive(Deserialize)]
struct PackageManifest {
    #[serde(default)]
    scripts: HashMap<String, String>,
}

pub fn detect(workspace: &Path) -> Detection {
    let manifest_path = workspace.join("package.json");
    if !manifest_path.exists() {
        return Detection {
            plan: BuildPlan::empty(),
            transcript: "No package.json manifest found (skipping build step)\n".to_string(),
        };
    }

    let raw = match std::fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(e) => {
            return Detection {
                plan: BuildPlan::empty(),
                transcript: format!("Failed to read package.json: {} (skipping build step)\n", e),
            };
        }
    };

    let manifest: PackageManifest = match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            return Detection {
                plan: BuildPlan::empty(),
                transcript: format!("Failed to parse package.json: {} (skipping build step)\n", e),
            };
        }
    };

    if manifest.scripts.contains_key("build") {
        Detection {
            plan: BuildPlan {
                install: Some(CommandSpec::new("npm", &["install", "--silent"])),
                build: Some(CommandSpec::new("npm", &["run", "build"])),
            },
            transcript: "Detected npm build script\n".to_string(),
        }
    } else {
        Detection {
            plan: BuildPlan::empty(),
            transcript: "No build script declared in package.json (skipping build step)\n"
                .to_string(),
        }
    }
}
