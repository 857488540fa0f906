//! Mapping of checkpoint paths seen in training logs to deployment locations.
//!
//! Two strategies exist:
//! - [`RewriteTable`] rewrites path prefixes for display and selection lists.
//! - [`relative_path`] plus [`resolve_volume_mount`] derive the path relative to
//!   the PVC a training job mounts, which is what a `pvc://` storage URI needs.

use tracing::debug;

use crate::error::ResolveError;
use crate::k8s::TrainingJob;

/// Ordered `training prefix -> deployment prefix` rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteTable {
    entries: Vec<(String, String)>,
}

impl RewriteTable {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// Rewrite the first matching prefix once. Paths with no matching entry are
    /// returned unchanged, as they are assumed to be deployment-visible already.
    pub fn map(&self, path: &str) -> String {
        self.entries
            .iter()
            .find_map(|(from, to)| path.strip_prefix(from.as_str()).map(|rest| format!("{to}{rest}")))
            .unwrap_or_else(|| path.to_string())
    }
}

/// A PVC-backed volume and where a container of the job mounts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume_name: String,
    pub pvc_claim_name: String,
    pub mount_path: String,
}

impl VolumeMount {
    /// Storage URI for a checkpoint below this mount.
    pub fn storage_uri(&self, checkpoint: &str) -> Result<String, ResolveError> {
        let relative = relative_path(&self.mount_path, checkpoint)?;
        Ok(format!("pvc://{}/{relative}", self.pvc_claim_name))
    }
}

/// Path of `checkpoint` relative to `mount_path`.
///
/// The checkpoint must lie strictly below the mount: a sibling that merely
/// shares a string prefix (`/opt/database` for `/opt/data`) is a mismatch, and
/// the mount root itself is rejected as ambiguous.
pub fn relative_path(mount_path: &str, checkpoint: &str) -> Result<String, ResolveError> {
    if !checkpoint.starts_with('/') {
        return Err(ResolveError::NotAbsolute(checkpoint.to_string()));
    }

    let mount = mount_path.trim_end_matches('/');
    let mismatch = || ResolveError::PathMismatch {
        checkpoint: checkpoint.to_string(),
        mount_path: mount_path.to_string(),
    };

    let remainder = checkpoint.strip_prefix(mount).ok_or_else(mismatch)?;
    if !remainder.is_empty() && !remainder.starts_with('/') {
        return Err(mismatch());
    }

    let relative = remainder.strip_prefix('/').unwrap_or(remainder);
    if relative.is_empty() {
        return Err(ResolveError::EmptyRelativePath {
            checkpoint: checkpoint.to_string(),
            mount_path: mount_path.to_string(),
        });
    }

    Ok(relative.to_string())
}

/// Find the PVC a training job writes to and the path it is mounted at.
///
/// Replica templates are searched in order; within a template the first
/// PVC-backed volume that some container mounts wins.
pub fn resolve_volume_mount(job: &TrainingJob) -> Result<VolumeMount, ResolveError> {
    let mut unmounted: Option<(String, String)> = None;

    for (replica, template) in &job.templates {
        let Some(spec) = template.spec.as_ref() else {
            continue;
        };

        let claims = spec.volumes.iter().flatten().filter_map(|volume| {
            volume
                .persistent_volume_claim
                .as_ref()
                .map(|pvc| (volume.name.as_str(), pvc.claim_name.as_str()))
        });

        for (volume_name, claim_name) in claims {
            let mount = spec
                .containers
                .iter()
                .flat_map(|c| c.volume_mounts.iter().flatten())
                .find(|m| m.name == volume_name);

            if let Some(mount) = mount {
                debug!(
                    job = %job.name,
                    replica = %replica,
                    claim = %claim_name,
                    mount_path = %mount.mount_path,
                    "Resolved training job volume mount"
                );
                return Ok(VolumeMount {
                    volume_name: volume_name.to_string(),
                    pvc_claim_name: claim_name.to_string(),
                    mount_path: mount.mount_path.clone(),
                });
            }

            unmounted.get_or_insert_with(|| (volume_name.to_string(), claim_name.to_string()));
        }
    }

    match unmounted {
        Some((volume, claim)) => Err(ResolveError::PvcNotMounted {
            job: job.name.clone(),
            volume,
            claim,
        }),
        None => Err(ResolveError::NoPvcFound {
            job: job.name.clone(),
        }),
    }
}
