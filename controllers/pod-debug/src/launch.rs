//! VS Code attach configuration.
//!
//! Writes `<projectRootDir>/.vscode/launch.json` so the IDE can attach to the
//! debug agent through the node port.

use anyhow::{Context, Result};
use debug_profile::DebugProfile;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const LAUNCH_VERSION: &str = "0.2.0";
const CONFIGURATION_NAME: &str = "Debug K8S Pod Container";

#[derive(Debug, Serialize)]
struct LaunchFile {
    version: &'static str,
    configurations: Vec<AttachConfiguration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachConfiguration {
    name: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    request: &'static str,
    mode: &'static str,
    show_log: bool,
    host: String,
    port: i32,
    remote_path: String,
}

impl LaunchFile {
    fn for_profile(profile: &DebugProfile) -> Self {
        Self {
            version: LAUNCH_VERSION,
            configurations: vec![AttachConfiguration {
                name: CONFIGURATION_NAME,
                kind: "go",
                request: "attach",
                mode: "remote",
                show_log: true,
                host: profile.node_host.clone(),
                port: profile.debug_port,
                remote_path: profile.project_root_dir.clone(),
            }],
        }
    }
}

/// Path of the attach descriptor for a project root.
pub fn launch_file_path(project_root: impl AsRef<Path>) -> PathBuf {
    project_root.as_ref().join(".vscode").join("launch.json")
}

/// (Over)write the attach descriptor, moving an existing one to `launch.json.bak`.
///
/// Returns the path written.
pub fn write_attach_config(profile: &DebugProfile) -> Result<PathBuf> {
    let path = launch_file_path(&profile.project_root_dir);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    if path.exists() {
        let backup = path.with_extension("json.bak");
        fs::rename(&path, &backup)
            .with_context(|| format!("backing up {} to {}", path.display(), backup.display()))?;
    }

    let mut rendered = serde_json::to_string_pretty(&LaunchFile::for_profile(profile))
        .context("rendering launch configuration")?;
    rendered.push('\n');
    fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;

    Ok(path)
}
