//! Workflow Material Resolution
//!
//! Places the workflow file and its parameter file where the engine can
//! read them:
//! - Git-hosted URLs are cloned into `<workflow_files>/repo` and checked
//!   out at the referenced branch or commit
//! - uploaded attachments are saved into `<workflow_files>`
//! - anything else is taken as a local path (`file://` prefix allowed)
//!
//! # Git URL Format
//!
//! ```text
//! https://github.com/org/repo/blob/main/wf/main.cwl[,wf/main.yml]
//! \__________ repo _________/      \__/ \_________/  \_________/
//!                                  ref   workflow     parameters
//! ```

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs;
use tokio::process::Command;

use crate::error::WesError;
use crate::run::RunRequest;

/// Name of the directory holding workflow material inside `out_dir`.
pub const WORKFLOW_FILES_DIR: &str = "workflow_files";

/// Extensions tried when looking for a parameter file next to the workflow.
const PARAM_EXTENSIONS: &[&str] = &["yml", "yaml", "json"];

static GIT_FILE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<repo_url>https?:.*)/(blob|src|tree)/(?P<reference>.*?)/(?P<workflow_path>.*?\.(cwl|yml|yaml|json))[,:;|]?(?P<params_path>.*\.(yml|yaml|json))?",
    )
    .expect("valid regex")
});

/// A file uploaded together with a run request.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// Workflow file inside a Git repository.
#[derive(Debug, Clone, PartialEq)]
pub struct GitSource {
    pub repo_url: String,
    /// Branch or commit to check out.
    pub reference: String,
    pub workflow_path: String,
    pub params_path: Option<String>,
}

impl GitSource {
    pub fn parse(url: &str) -> Option<Self> {
        let caps = GIT_FILE_URL.captures(url)?;
        Some(Self {
            repo_url: caps["repo_url"].to_string(),
            reference: caps["reference"].to_string(),
            workflow_path: caps["workflow_path"].to_string(),
            params_path: caps
                .name("params_path")
                .map(|m| m.as_str().to_string())
                .filter(|p| !p.is_empty()),
        })
    }
}

/// Resolved workflow and parameter file locations.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub workflow_files: PathBuf,
    pub workflow_path: PathBuf,
    pub param_file_path: PathBuf,
}

/// Reduces an uploaded file name to a safe single path component.
///
/// Returns `None` if nothing usable remains.
pub fn secure_filename(name: &str) -> Option<String> {
    let flattened = name.replace(['/', '\\'], " ");
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Populates `<out_dir>/workflow_files` for `request`.
///
/// May re-point `request.workflow_url` at an uploaded attachment.
pub async fn resolve(
    request: &mut RunRequest,
    out_dir: &Path,
    attachments: &[Attachment],
) -> Result<Material, WesError> {
    let workflow_files = out_dir.join(WORKFLOW_FILES_DIR);
    fs::create_dir(&workflow_files).await?;

    let git = GitSource::parse(&request.workflow_url);
    let workflow_path = match &git {
        Some(source) => {
            let repo = workflow_files.join("repo");
            fetch_repository(source, &repo).await?;
            repo.join(&source.workflow_path)
        }
        None => {
            if !attachments.is_empty() {
                save_attachments(&workflow_files, attachments).await?;
                if let Some(attached) = attached_workflow(&workflow_files, &request.workflow_url) {
                    debug!("Workflow URL points to attachment {}", attached.display());
                    request.workflow_url = attached.to_string_lossy().into_owned();
                }
            }
            local_path(&request.workflow_url)
        }
    };

    let param_file_path =
        resolve_param_file(request, &workflow_files, &workflow_path, git.as_ref()).await?;

    Ok(Material {
        workflow_files,
        workflow_path,
        param_file_path,
    })
}

/// Turns a `file://` URL or plain path into a path.
fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

fn attached_workflow(workflow_files: &Path, workflow_url: &str) -> Option<PathBuf> {
    let candidate = workflow_files.join(secure_filename(workflow_url)?);
    candidate.is_file().then_some(candidate)
}

async fn save_attachments(dir: &Path, attachments: &[Attachment]) -> Result<(), WesError> {
    for attachment in attachments {
        let Some(name) = secure_filename(&attachment.filename) else {
            warn!("Skipping attachment with unusable name '{}'", attachment.filename);
            continue;
        };
        fs::write(dir.join(&name), &attachment.content).await?;
        debug!("Saved attachment '{}' ({} bytes)", name, attachment.content.len());
    }
    Ok(())
}

async fn fetch_repository(source: &GitSource, repo: &Path) -> Result<(), WesError> {
    let clone_url = format!("{}.git", source.repo_url);
    info!("Cloning {} at '{}'", clone_url, source.reference);

    run_git(&["clone", &clone_url, &repo.to_string_lossy()]).await.map_err(|e| {
        WesError::InvalidRequest(format!(
            "could not clone Git repository '{}': {}. Check value of 'workflow_url'",
            clone_url, e
        ))
    })?;

    let git_dir = repo.join(".git");
    run_git(&[
        "--git-dir",
        &git_dir.to_string_lossy(),
        "--work-tree",
        &repo.to_string_lossy(),
        "checkout",
        &source.reference,
    ])
    .await
    .map_err(|e| {
        WesError::InvalidRequest(format!(
            "could not check out '{}': {}. Check value of 'workflow_url'",
            source.reference, e
        ))
    })
}

async fn run_git(args: &[&str]) -> Result<(), String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Picks the parameter file, in order: inline parameters, the parameter
/// path of a Git URL, a file next to the workflow sharing its stem, and
/// finally the (empty) inline parameters.
async fn resolve_param_file(
    request: &RunRequest,
    workflow_files: &Path,
    workflow_path: &Path,
    git: Option<&GitSource>,
) -> Result<PathBuf, WesError> {
    let stem = workflow_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());

    if request.workflow_params.is_empty() {
        if let Some(params) = git.and_then(|g| g.params_path.as_deref()) {
            return Ok(workflow_files.join("repo").join(params));
        }

        if let Some(dir) = workflow_path.parent() {
            for ext in PARAM_EXTENSIONS {
                let candidate = dir.join(format!("{}.{}", stem, ext));
                if candidate.is_file() {
                    debug!("Using parameter file {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }
    }

    let path = workflow_files.join(format!("{}.yml", stem));
    let yaml = serde_yaml::to_string(&request.workflow_params)
        .map_err(|e| WesError::InvalidRequest(format!("workflow_params: {}", e)))?;
    fs::write(&path, yaml).await?;
    debug!("Wrote parameter file {}", path.display());
    Ok(path)
}
