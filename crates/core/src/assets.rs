//! Shared asset bundles
//!
//! Model files live on read-only NFS exports. Starting an app with a bundle
//! selected mounts the export (once per host) and links every entry of every
//! category directory into the app's own model tree. Existing paths in the
//! install are never replaced, so local files shadow shared ones and links
//! from an earlier start are left alone.

use crate::errors::{AssetError, Result};
use crate::events::{EventSink, LifecycleEvent};
use crate::exec::{CommandRunner, CommandSpec, ExecEnv};
use crate::settings::{AssetBundle, AssetSettings};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Form value meaning "no shared assets"
pub const BARE: &str = "bare";

/// Outcome of one linking pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    /// Links created, as paths inside the install
    pub linked: Vec<PathBuf>,
    /// Paths that already existed and were left untouched
    pub skipped: Vec<PathBuf>,
}

/// Link every `<share>/<category>/<entry>` to `<dest>/<category>/<entry>`
///
/// A destination that exists in any form, including a dangling link, is
/// skipped. Non-directory entries directly under `share` are ignored.
#[instrument(skip_all, fields(share = %share.display(), dest = %dest.display()))]
pub fn link_assets(share: &Path, dest: &Path) -> Result<LinkReport> {
    if !share.is_dir() {
        return Err(AssetError::MountMissing {
            path: share.display().to_string(),
        }
        .into());
    }

    let mut report = LinkReport::default();
    let mut categories = read_dir_sorted(share)?;
    categories.retain(|p| p.is_dir());

    for category in categories {
        let Some(category_name) = category.file_name() else {
            continue;
        };
        let target_dir = dest.join(category_name);
        for entry in read_dir_sorted(&category)? {
            let Some(entry_name) = entry.file_name() else {
                continue;
            };
            let target = target_dir.join(entry_name);
            if std::fs::symlink_metadata(&target).is_ok() {
                debug!("Keeping existing {}", target.display());
                report.skipped.push(target);
                continue;
            }
            let link_error = |e: std::io::Error| AssetError::Link {
                source_path: entry.display().to_string(),
                target: target.display().to_string(),
                reason: e.to_string(),
            };
            std::fs::create_dir_all(&target_dir).map_err(link_error)?;
            std::os::unix::fs::symlink(&entry, &target).map_err(link_error)?;
            report.linked.push(target);
        }
    }

    info!(
        "Linked {} assets, kept {} existing",
        report.linked.len(),
        report.skipped.len()
    );
    Ok(report)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(AssetError::Io)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(AssetError::Io)?;
    entries.sort();
    Ok(entries)
}

/// Whether `mount_point` appears as a mount target in `/proc/mounts` content
pub fn is_listed_mount(mounts: &str, mount_point: &Path) -> bool {
    let wanted = mount_point.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| target.replace("\\040", " ") == wanted)
}

/// Whether something is currently mounted at `mount_point`
pub fn is_mounted(mount_point: &Path) -> bool {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => is_listed_mount(&mounts, mount_point),
        Err(e) => {
            debug!("Cannot read /proc/mounts: {}", e);
            false
        }
    }
}

/// `mount` command line for a bundle
pub fn mount_command(bundle: &AssetBundle, mount_point: &Path) -> String {
    let mount_point = mount_point.display().to_string();
    format!(
        "mkdir -p {mp} && mount -t nfs -o {opts} {remote} {mp}",
        mp = shell_words::quote(&mount_point),
        opts = shell_words::quote(&bundle.options),
        remote = shell_words::quote(&bundle.remote()),
    )
}

/// Mount a bundle's export unless it is already mounted
///
/// Returns the local mount point.
#[instrument(skip(settings, runner, env, events), fields(bundle = %bundle.name))]
pub async fn mount_bundle(
    settings: &AssetSettings,
    bundle: &AssetBundle,
    runner: &dyn CommandRunner,
    env: &ExecEnv,
    events: &mut dyn EventSink,
) -> Result<PathBuf> {
    let mount_point = settings.mount_point(bundle);
    let already_mounted = is_mounted(&mount_point);
    if already_mounted {
        debug!("{} already mounted", mount_point.display());
    } else {
        let spec = CommandSpec::new(mount_command(bundle, &mount_point)).with_env(env.clone());
        runner.run(&spec, events).await?;
    }

    let event = LifecycleEvent::AssetsMounted {
        id: LifecycleEvent::next_id(),
        timestamp: LifecycleEvent::now(),
        bundle: bundle.name.clone(),
        mount_point: mount_point.display().to_string(),
        already_mounted,
    };
    if let Err(e) = events.emit(&event) {
        debug!("Failed to emit lifecycle event: {}", e);
    }
    Ok(mount_point)
}

/// Mount `bundle_name` and link its contents under `dest`
///
/// `bare` skips both steps and returns `None`.
pub async fn attach_bundle(
    settings: &AssetSettings,
    bundle_name: &str,
    dest: &Path,
    runner: &dyn CommandRunner,
    env: &ExecEnv,
    events: &mut dyn EventSink,
) -> Result<Option<LinkReport>> {
    if bundle_name == BARE {
        return Ok(None);
    }
    let bundle = settings.bundle(bundle_name)?;
    let mount_point = mount_bundle(settings, bundle, runner, env, events).await?;
    let report = link_assets(&mount_point, dest)?;

    let event = LifecycleEvent::AssetsLinked {
        id: LifecycleEvent::next_id(),
        timestamp: LifecycleEvent::now(),
        bundle: bundle.name.clone(),
        linked: report.linked.len(),
        skipped: report.skipped.len(),
    };
    if let Err(e) = events.emit(&event) {
        debug!("Failed to emit lifecycle event: {}", e);
    }
    Ok(Some(report))
}
