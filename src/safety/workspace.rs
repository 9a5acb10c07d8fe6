/// Disposable per-submission workspaces
///
/// One directory per submission under the workspace root, named from the
/// monotonically unique submission id plus a random suffix so that no two live
/// submissions share a path. `destroy` runs exactly once per workspace; a
/// workspace dropped without it is handed to the janitor.
use crate::config::harness::HarnessConfig;
use crate::config::types::{HarnessError, Result, SourceUnit, SubmissionId};
use crate::kernel::identity::SandboxIdentity;
use crate::observability::metrics::HarnessMetrics;
use crate::safety::janitor::Janitor;
use crate::safety::purge::purge_tree;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "sub-";

/// How a `destroy` call finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Tree removed before the cleanup bound
    Removed,
    /// Removal failed or overran; the janitor owns it now
    Deferred,
}

pub struct Workspace {
    name: String,
    submission: SubmissionId,
    root: PathBuf,
    owner: Option<SandboxIdentity>,
    destroyed: bool,
    janitor: Janitor,
    metrics: Arc<HarnessMetrics>,
}

impl Workspace {
    /// Directory name, unique among live workspaces
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submission(&self) -> SubmissionId {
        self.submission
    }

    /// Host path of the workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner(&self) -> Option<SandboxIdentity> {
        self.owner
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.destroyed {
            log::warn!(
                "Workspace {} dropped without destroy, deferring removal",
                self.root.display()
            );
            self.destroyed = true;
            self.metrics.workspaces_destroyed.inc();
            self.janitor.defer(self.root.clone());
        }
    }
}

/// Reject names that are empty, absolute, or step outside the workspace.
pub fn check_unit_name(name: &str) -> std::result::Result<PathBuf, String> {
    if name.is_empty() {
        return Err("source unit with empty name".to_string());
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(format!("source unit name '{}' contains a forbidden character", name.escape_default()));
    }
    let path = Path::new(name);
    let mut depth = 0;
    for component in path.components() {
        match component {
            Component::Normal(part) if part.len() <= 255 => depth += 1,
            Component::Normal(_) => return Err(format!("source unit name '{name}' has an overlong component")),
            _ => return Err(format!("source unit name '{name}' escapes the workspace")),
        }
    }
    if depth == 0 || depth > 16 {
        return Err(format!("source unit name '{name}' is not a usable relative path"));
    }
    Ok(path.to_path_buf())
}

/// Synchronous admission check for a submission's source units.
pub fn check_sources(
    units: &[SourceUnit],
    max_unit_bytes: u64,
    max_units: usize,
) -> std::result::Result<(), String> {
    if units.is_empty() {
        return Err("submission has no source units".to_string());
    }
    if units.len() > max_units {
        return Err(format!(
            "submission has {} source units, limit is {}",
            units.len(),
            max_units
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for unit in units {
        let path = check_unit_name(&unit.name)?;
        if unit.content.len() as u64 > max_unit_bytes {
            return Err(format!(
                "source unit '{}' is {} bytes, limit is {}",
                unit.name,
                unit.content.len(),
                max_unit_bytes
            ));
        }
        if !seen.insert(path) {
            return Err(format!("source unit '{}' is submitted twice", unit.name));
        }
    }
    Ok(())
}

fn exhausted_or_io(err: std::io::Error, what: String) -> HarnessError {
    match err.raw_os_error() {
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => {
            HarnessError::ResourceExhausted(format!("{what}: {err}"))
        }
        _ => HarnessError::Workspace(format!("{what}: {err}")),
    }
}

fn chown(path: &Path, owner: Option<SandboxIdentity>) -> Result<()> {
    if let Some(identity) = owner {
        std::os::unix::fs::lchown(path, Some(identity.uid), Some(identity.gid)).map_err(|e| {
            HarnessError::Workspace(format!("Failed to chown {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

pub struct WorkspaceManager {
    base_dir: PathBuf,
    max_unit_bytes: u64,
    max_units: usize,
    cleanup_timeout: Duration,
    janitor: Janitor,
    metrics: Arc<HarnessMetrics>,
}

impl WorkspaceManager {
    pub fn new(config: &HarnessConfig, janitor: Janitor, metrics: Arc<HarnessMetrics>) -> Result<Self> {
        let base_dir = config.workspace_root.clone();
        fs::create_dir_all(&base_dir).map_err(|e| {
            exhausted_or_io(e, format!("Failed to create workspace root {}", base_dir.display()))
        })?;
        // Sandbox identities must be able to traverse into their own workspace
        // without listing the others.
        fs::set_permissions(&base_dir, fs::Permissions::from_mode(0o711))?;

        Ok(WorkspaceManager {
            base_dir,
            max_unit_bytes: config.max_source_bytes,
            max_units: config.max_source_files,
            cleanup_timeout: config.cleanup_timeout(),
            janitor,
            metrics,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Allocate a fresh, empty, exclusive directory for a submission.
    pub fn create(&self, submission: SubmissionId, owner: Option<SandboxIdentity>) -> Result<Workspace> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", submission, &suffix[..12]);
        let root = self.base_dir.join(&name);

        fs::DirBuilder::new()
            .mode(0o700)
            .create(&root)
            .map_err(|e| exhausted_or_io(e, format!("Failed to create workspace {}", root.display())))?;

        self.metrics.workspaces_created.inc();
        let workspace = Workspace {
            name,
            submission,
            root,
            owner,
            destroyed: false,
            janitor: self.janitor.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        chown(&workspace.root, owner)?;

        log::debug!("Created workspace {} for {}", workspace.root.display(), submission);
        Ok(workspace)
    }

    /// Write source units verbatim. Names are checked again here so that staging
    /// never depends on the caller having validated them.
    pub fn stage(&self, workspace: &Workspace, units: &[SourceUnit]) -> Result<Vec<PathBuf>> {
        check_sources(units, self.max_unit_bytes, self.max_units)
            .map_err(HarnessError::InvalidSubmission)?;

        let mut written = Vec::with_capacity(units.len());
        for unit in units {
            let relative = check_unit_name(&unit.name).map_err(HarnessError::InvalidSubmission)?;
            let target = workspace.root.join(&relative);

            if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
                let mut current = workspace.root.clone();
                for component in parent.components() {
                    current.push(component);
                    match fs::DirBuilder::new().mode(0o700).create(&current) {
                        Ok(()) => chown(&current, workspace.owner)?,
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                        Err(e) => {
                            return Err(exhausted_or_io(
                                e,
                                format!("Failed to create {}", current.display()),
                            ))
                        }
                    }
                }
            }

            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&target)
                .map_err(|e| exhausted_or_io(e, format!("Failed to stage {}", target.display())))?;
            file.write_all(unit.content.as_bytes())
                .map_err(|e| exhausted_or_io(e, format!("Failed to write {}", target.display())))?;
            chown(&target, workspace.owner)?;
            written.push(target);
        }
        Ok(written)
    }

    /// Remove the workspace. Blocks for at most the cleanup timeout; a removal
    /// that fails or is still running by then continues in the background.
    pub fn destroy(&self, mut workspace: Workspace) -> CleanupOutcome {
        workspace.destroyed = true;
        self.metrics.workspaces_destroyed.inc();
        let root = workspace.root.clone();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let janitor = self.janitor.clone();
        let path = root.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("runbox-rm-{}", workspace.submission.0))
            .spawn(move || {
                let removed = match purge_tree(&path) {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!("Workspace removal failed for {}: {}", path.display(), err);
                        janitor.defer(path);
                        false
                    }
                };
                let _ = tx.send(removed);
            });

        if let Err(err) = spawned {
            log::warn!("Could not spawn workspace remover: {}", err);
            self.metrics.cleanup_deferred.inc();
            self.janitor.defer(root);
            return CleanupOutcome::Deferred;
        }

        match rx.recv_timeout(self.cleanup_timeout) {
            Ok(true) => {
                log::debug!("Destroyed workspace {}", root.display());
                CleanupOutcome::Removed
            }
            Ok(false) => {
                self.metrics.cleanup_deferred.inc();
                CleanupOutcome::Deferred
            }
            Err(_) => {
                log::warn!(
                    "Workspace removal of {} exceeded {:?}, continuing in background",
                    root.display(),
                    self.cleanup_timeout
                );
                self.metrics.cleanup_deferred.inc();
                CleanupOutcome::Deferred
            }
        }
    }

    /// Remove workspaces left behind by an earlier process.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to read workspace entry: {}", e);
                    continue;
                }
            };
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            match age {
                Some(age) if age >= max_age => match purge_tree(&path) {
                    Ok(()) => {
                        log::info!("Swept stale workspace {}", path.display());
                        removed += 1;
                    }
                    Err(e) => log::warn!("Failed to sweep {}: {}", path.display(), e),
                },
                _ => {}
            }
        }
        Ok(removed)
    }

    /// Number of workspace directories currently on disk
    pub fn live_count(&self) -> usize {
        fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX))
                    .count()
            })
            .unwrap_or(0)
    }
}
