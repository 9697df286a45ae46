//! Reference-counted registry of known volumes
//!
//! One [`MountRecord`] per volume name. The registry itself is not
//! synchronized; [`MountManager`](crate::mount::MountManager) owns it behind
//! the single lock that also covers every mount and unmount.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{Result, VolumeError};
use crate::exec::CommandRunner;
use crate::options::{self, VolumeOptions};

/// State kept for one volume name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub name: String,
    /// Where the volume is exposed on the host
    pub host_path: PathBuf,
    /// Number of consumers currently holding the mount
    pub connections: u32,
    pub options: VolumeOptions,
    /// Created explicitly; survives zero connections until removed
    pub managed: bool,
}

impl MountRecord {
    pub fn is_active(&self) -> bool {
        self.connections > 0
    }
}

/// Name and mount point, as reported by list/get
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: PathBuf,
}

/// Canonical registry key for a volume name.
///
/// Drops `.` components and redundant separators, so `./data/` and `data`
/// map to the same key. `None` for empty names and for names that would
/// leave the mount root (absolute paths, `..`).
pub fn canonical_name(name: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.iter().all(|p| p.trim().is_empty()) {
        return None;
    }
    Some(parts.join("/"))
}

/// Mount point for `name` under `root`
pub fn host_path(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// In-memory map from volume name to [`MountRecord`]
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: HashMap<String, MountRecord>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_mount(&self, name: &str) -> bool {
        self.mounts.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&MountRecord> {
        self.mounts.get(name)
    }

    /// Connection count, 0 for unknown names
    pub fn count(&self, name: &str) -> u32 {
        self.mounts.get(name).map_or(0, |m| m.connections)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.mounts.get(name).is_some_and(MountRecord::is_active)
    }

    /// Register one more consumer, creating an unmanaged record on first use
    pub fn add(&mut self, name: &str, host_path: &Path) {
        match self.mounts.get_mut(name) {
            Some(mount) => mount.connections += 1,
            None => {
                self.mounts.insert(
                    name.to_string(),
                    MountRecord {
                        name: name.to_string(),
                        host_path: host_path.to_path_buf(),
                        connections: 1,
                        options: VolumeOptions::new(),
                        managed: false,
                    },
                );
            }
        }
    }

    /// Register an explicitly created volume.
    ///
    /// An active record only has its options replaced. Otherwise a fresh
    /// managed record with no connections takes its place.
    pub fn create(&mut self, name: &str, host_path: &Path, opts: VolumeOptions) -> &MountRecord {
        match self.mounts.entry(name.to_string()) {
            Entry::Occupied(entry) if entry.get().is_active() => {
                let record = entry.into_mut();
                record.options = opts;
                record
            }
            entry => {
                let record = MountRecord {
                    name: name.to_string(),
                    host_path: host_path.to_path_buf(),
                    connections: 0,
                    options: opts,
                    managed: true,
                };
                match entry {
                    Entry::Occupied(mut entry) => {
                        entry.insert(record);
                        entry.into_mut()
                    }
                    Entry::Vacant(entry) => entry.insert(record),
                }
            }
        }
    }

    /// Returns the new count, 0 for unknown names
    pub fn increment(&mut self, name: &str) -> u32 {
        match self.mounts.get_mut(name) {
            Some(mount) => {
                mount.connections += 1;
                mount.connections
            }
            None => 0,
        }
    }

    /// Returns the new count; never goes below zero
    pub fn decrement(&mut self, name: &str) -> u32 {
        match self.mounts.get_mut(name) {
            Some(mount) => {
                mount.connections = mount.connections.saturating_sub(1);
                mount.connections
            }
            None => 0,
        }
    }

    /// Remove a record with no connections. Unknown names are not an error.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        debug!("Delete volume: {}, connections: {}", name, self.count(name));
        if self.count(name) > 0 {
            return Err(VolumeError::InUse(name.to_string()));
        }
        self.mounts.remove(name);
        Ok(())
    }

    /// Remove an idle, unmanaged record. Returns whether it was removed.
    pub fn delete_if_not_managed(&mut self, name: &str) -> bool {
        match self.mounts.get(name) {
            Some(mount) if !mount.is_active() && !mount.managed => {
                info!("Removing un-managed volume {}", name);
                self.mounts.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn has_options(&self, name: &str) -> bool {
        self.mounts.get(name).is_some_and(|m| !m.options.is_empty())
    }

    pub fn has_option(&self, name: &str, key: &str) -> bool {
        self.mounts
            .get(name)
            .is_some_and(|m| m.options.contains_key(key))
    }

    /// Copy of the volume's options, empty for unknown names
    pub fn options(&self, name: &str) -> VolumeOptions {
        self.mounts
            .get(name)
            .map(|m| m.options.clone())
            .unwrap_or_default()
    }

    pub fn get_option(&self, name: &str, key: &str) -> Option<&str> {
        self.mounts
            .get(name)
            .and_then(|m| m.options.get(key))
            .map(String::as_str)
    }

    pub fn get_option_as_bool(&self, name: &str, key: &str) -> bool {
        self.get_option(name, key).is_some_and(options::is_truthy)
    }

    /// Snapshot of every known volume, sorted by name
    pub fn volumes(&self) -> Vec<VolumeInfo> {
        let mut volumes: Vec<VolumeInfo> = self
            .mounts
            .values()
            .map(|m| VolumeInfo {
                name: m.name.clone(),
                mountpoint: m.host_path.clone(),
            })
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Seed connection counts from volumes that are still in use on the host.
    ///
    /// Runs the enumeration script (if configured), then reads its
    /// `<name> <refs>` result file. Any failure leaves the registry untouched
    /// and is only logged. Returns the number of volumes seeded.
    pub fn build_references(
        &mut self,
        root: &Path,
        driver_kind: &str,
        reconcile: &ReconcileConfig,
        runner: &dyn CommandRunner,
    ) -> usize {
        match enumerate_references(root, driver_kind, reconcile, runner) {
            Ok(refs) => {
                let mut seeded = 0;
                for (name, count) in refs {
                    if count == 0 {
                        continue;
                    }
                    debug!("Found existing volume in use with {} references: {}", count, name);
                    let path = host_path(root, &name);
                    for _ in 0..count {
                        self.add(&name, &path);
                    }
                    seeded += 1;
                }
                info!("Reconciled {} existing {} volume(s)", seeded, driver_kind);
                seeded
            }
            Err(e) => {
                warn!("Starting with no known volumes: {}", e);
                0
            }
        }
    }
}

fn enumerate_references(
    root: &Path,
    driver_kind: &str,
    reconcile: &ReconcileConfig,
    runner: &dyn CommandRunner,
) -> Result<Vec<(String, u32)>> {
    if let Some(script) = &reconcile.script {
        let program = script.to_string_lossy();
        let args = vec![driver_kind.to_string(), root.to_string_lossy().into_owned()];
        let out = runner.run(&program, &args).map_err(|e| {
            VolumeError::Reconciliation(format!("cannot run {}: {}", program, e))
        })?;
        if !out.success {
            return Err(VolumeError::Reconciliation(format!(
                "{} failed: {}",
                program,
                out.output.trim()
            )));
        }
    }

    let content = std::fs::read_to_string(&reconcile.refs_file).map_err(|e| {
        VolumeError::Reconciliation(format!("cannot read {:?}: {}", reconcile.refs_file, e))
    })?;
    parse_references(&content)
}

/// Parse `<name> <refs>` lines. Blank lines are ignored, as are names that
/// would resolve outside the mount root; anything else malformed rejects the
/// whole file. Names come back in canonical form.
pub fn parse_references(content: &str) -> Result<Vec<(String, u32)>> {
    let mut refs = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            [name, count] => {
                let count = count.parse::<u32>().map_err(|_| {
                    VolumeError::Reconciliation(format!(
                        "line {}: invalid reference count {:?}",
                        idx + 1,
                        count
                    ))
                })?;
                match canonical_name(name) {
                    Some(name) => refs.push((name, count)),
                    None => warn!(
                        "line {}: ignoring volume {:?} outside the mount root",
                        idx + 1,
                        name
                    ),
                }
            }
            _ => {
                return Err(VolumeError::Reconciliation(format!(
                    "line {}: expected `<name> <count>`, got {:?}",
                    idx + 1,
                    line
                )));
            }
        }
    }
    Ok(refs)
}
