//! Volume mount lifecycle
//!
//! [`MountManager`] decides when a request needs a real `mount`/`umount` and
//! when an existing mount can be shared. A single lock covers the registry
//! and every external invocation, so two requests never race on the same
//! mount point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use tracing::{debug, info, warn};

use crate::config::{CephDefaults, Config, ReconcileConfig, DRIVER_KIND};
use crate::credentials::CredentialResolver;
use crate::error::{Result, VolumeError};
use crate::exec::{self, CommandRunner, MountExecutor};
use crate::keyring::{KeyCache, KeyringCleaner, CEPH_KEY_DESCRIPTION};
use crate::options::{self, VolumeOptions};
use crate::registry::{self, MountRegistry, VolumeInfo};

/// Mount manager - handles lifecycle of all volumes
pub struct MountManager {
    /// Known volumes; the lock is held across mount/unmount invocations
    registry: Mutex<MountRegistry>,
    /// Directory volumes are mounted under
    root: PathBuf,
    resolver: CredentialResolver,
    executor: MountExecutor,
    keyring: KeyringCleaner,
    runner: Arc<dyn CommandRunner>,
}

impl MountManager {
    /// Create a manager with an empty registry
    pub fn new(
        root: PathBuf,
        defaults: CephDefaults,
        runner: Arc<dyn CommandRunner>,
        keys: Arc<dyn KeyCache>,
    ) -> Self {
        Self {
            registry: Mutex::new(MountRegistry::new()),
            root,
            resolver: CredentialResolver::new(defaults),
            executor: MountExecutor::new(runner.clone()),
            keyring: KeyringCleaner::new(keys),
            runner,
        }
    }

    /// Create a manager from config and recover volumes still in use on the host
    pub fn start(config: &Config, runner: Arc<dyn CommandRunner>, keys: Arc<dyn KeyCache>) -> Self {
        let manager = Self::new(config.mount_root.clone(), config.ceph.clone(), runner, keys);
        manager.reconcile(&config.reconcile);
        manager
    }

    /// Rebuild connection counts from host state. Never fails.
    pub fn reconcile(&self, reconcile: &ReconcileConfig) -> usize {
        let mut registry = self.registry.lock();
        registry.build_references(&self.root, DRIVER_KIND, reconcile, self.runner.as_ref())
    }

    /// Attach one consumer to `name`, mounting it if nobody holds it yet.
    ///
    /// Returns the host path the volume is available at.
    pub fn mount(&self, name: &str, request_id: &str) -> Result<PathBuf> {
        debug!("Entering Mount: {} ({})", name, request_id);
        let name = canonical_name(name)?;
        let name = name.as_str();

        let mut registry = self.registry.lock();

        if registry.is_active(name) {
            registry.increment(name);
            let hostdir = registry
                .get(name)
                .map(|m| m.host_path.clone())
                .unwrap_or_else(|| self.host_path(name));
            info!("Using existing CEPH volume mount: {:?}", hostdir);
            return Ok(hostdir);
        }

        let hostdir = registry
            .get(name)
            .map(|m| m.host_path.clone())
            .unwrap_or_else(|| self.host_path(name));
        registry.add(name, &hostdir);

        // Undo the registration unless the mount goes through
        let registry = scopeguard::guard(registry, |mut registry| {
            registry.decrement(name);
            registry.delete_if_not_managed(name);
        });

        exec::ensure_mount_dir(&hostdir)?;
        let spec = self.resolver.resolve(name, &registry.options(name), &hostdir)?;

        info!("Mounting CEPH volume {} on {:?}", spec.source, hostdir);
        self.executor.mount_volume(&spec)?;

        drop(ScopeGuard::into_inner(registry));
        Ok(hostdir)
    }

    /// Release one consumer of `name`, unmounting after the last one.
    ///
    /// Unknown or idle volumes are treated as already unmounted.
    pub fn unmount(&self, name: &str, request_id: &str) -> Result<()> {
        debug!("Entering Unmount: {} ({})", name, request_id);
        let name = canonical_name(name)?;
        let name = name.as_str();

        let mut registry = self.registry.lock();

        let (hostdir, connections) = match registry.get(name) {
            Some(m) => (m.host_path.clone(), m.connections),
            None => {
                debug!("Unmount for unknown volume {}, nothing to do", name);
                return Ok(());
            }
        };

        match connections {
            0 => {
                debug!("Volume {} is not mounted, nothing to do", name);
                return Ok(());
            }
            1 => {}
            _ => {
                info!("Skipping unmount for {} - in use by other containers", name);
                registry.decrement(name);
                return Ok(());
            }
        }

        registry.decrement(name);
        info!("Unmounting volume {} from {:?}", name, hostdir);

        if let Err(e) = self.executor.unmount_volume(&hostdir) {
            // Host still has it mounted; keep the last consumer counted so a retry unmounts
            registry.increment(name);
            return Err(e);
        }

        registry.delete_if_not_managed(name);

        self.keyring.unlink_key(CEPH_KEY_DESCRIPTION);

        if let Err(e) = exec::remove_mount_dir(&hostdir) {
            warn!("Failed to remove mount point {:?}: {}", hostdir, e);
            return Err(e);
        }
        Ok(())
    }

    /// Register a volume without mounting it.
    ///
    /// `share#name` registers `name` with the share as its source.
    pub fn create(&self, name: &str, opts: VolumeOptions) -> Result<()> {
        debug!("Entering Create: {}", name);
        let (name, implied) = options::resolve_name(name);
        let name = canonical_name(&name)?;

        let opts = match implied {
            Some(implied) => options::merge(&opts, &implied),
            None => opts,
        };

        let mut registry = self.registry.lock();
        let hostdir = self.host_path(&name);
        let record = registry.create(&name, &hostdir, opts);
        info!(
            "Created volume {} (connections: {}, managed: {})",
            name, record.connections, record.managed
        );
        Ok(())
    }

    /// Forget a volume. Fails while any consumer holds it.
    pub fn remove(&self, name: &str) -> Result<()> {
        debug!("Entering Remove: {}", name);
        let name = canonical_name(name)?;
        let name = name.as_str();
        let mut registry = self.registry.lock();
        if registry.count(name) >= 1 {
            return Err(VolumeError::InUse(name.to_string()));
        }
        registry.delete(name)?;
        info!("Removed volume {}", name);
        Ok(())
    }

    /// Host path for `name`, whether or not it is known
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        let name = canonical_name(name)?;
        let name = name.as_str();
        let registry = self.registry.lock();
        Ok(registry
            .get(name)
            .map(|m| m.host_path.clone())
            .unwrap_or_else(|| self.host_path(name)))
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        let name = canonical_name(name)?;
        let name = name.as_str();
        let registry = self.registry.lock();
        registry
            .get(name)
            .map(|m| VolumeInfo {
                name: m.name.clone(),
                mountpoint: m.host_path.clone(),
            })
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<VolumeInfo> {
        self.registry.lock().volumes()
    }

    /// Current connection count for `name`; 0 for invalid names
    pub fn count(&self, name: &str) -> u32 {
        match registry::canonical_name(name) {
            Some(name) => self.registry.lock().count(&name),
            None => 0,
        }
    }

    /// Whether the kernel still caches a ceph key
    pub fn key_cached(&self) -> bool {
        self.keyring.is_key_present(CEPH_KEY_DESCRIPTION)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, name: &str) -> PathBuf {
        registry::host_path(&self.root, name)
    }
}

/// Registry key for `name`; rejects names that would place the mount point
/// outside the root
fn canonical_name(name: &str) -> Result<String> {
    registry::canonical_name(name).ok_or_else(|| VolumeError::InvalidName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CEPH_PORT;
    use crate::error::FailureKind;
    use crate::exec::CommandOutput;
    use crate::keyring::KeySerial;
    use std::collections::HashMap;
    use std::io;
    use std::time::Duration;

    /// Stands in for mount/umount; counts invocations
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        mount_failure: Mutex<Option<String>>,
        umount_failure: Mutex<Option<String>>,
        delay: Option<Duration>,
    }

    impl FakeRunner {
        fn invocations(&self, program: &str) -> usize {
            self.calls.lock().iter().filter(|(p, _)| p == program).count()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.calls.lock().push((program.to_string(), args.to_vec()));
            let failure = match program {
                "mount" => self.mount_failure.lock().clone(),
                "umount" => self.umount_failure.lock().clone(),
                _ => None,
            };
            Ok(match failure {
                Some(output) => CommandOutput::failed(output),
                None => CommandOutput::ok(),
            })
        }
    }

    #[derive(Default)]
    struct FakeKeys {
        keys: Mutex<HashMap<String, KeySerial>>,
    }

    impl KeyCache for FakeKeys {
        fn search(&self, _key_type: &str, description: &str) -> io::Result<Option<KeySerial>> {
            Ok(self.keys.lock().get(description).copied())
        }

        fn unlink(&self, key: KeySerial) -> io::Result<()> {
            self.keys.lock().retain(|_, k| *k != key);
            Ok(())
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        runner: Arc<FakeRunner>,
        keys: Arc<FakeKeys>,
        manager: MountManager,
    }

    fn defaults() -> CephDefaults {
        CephDefaults {
            username: "admin".to_string(),
            password: "AQDdefault==".to_string(),
            context: String::new(),
            endpoint: "mon1".to_string(),
            port: DEFAULT_CEPH_PORT,
            options: None,
        }
    }

    fn fixture_with(runner: FakeRunner) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let runner = Arc::new(runner);
        let keys = Arc::new(FakeKeys::default());
        let manager = MountManager::new(
            root.path().to_path_buf(),
            defaults(),
            runner.clone(),
            keys.clone(),
        );
        Fixture {
            root,
            runner,
            keys,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeRunner::default())
    }

    #[test]
    fn test_first_mount_mounts_and_shares() {
        let f = fixture();
        let p1 = f.manager.mount("data", "c1").unwrap();
        let p2 = f.manager.mount("data", "c2").unwrap();

        assert_eq!(p1, f.root.path().join("data"));
        assert_eq!(p1, p2);
        assert!(p1.is_dir());
        assert_eq!(f.runner.invocations("mount"), 1);
        assert_eq!(f.manager.count("data"), 2);
    }

    #[test]
    fn test_mount_passes_resolved_source() {
        let f = fixture();
        f.manager.mount("data", "c1").unwrap();
        let calls = f.runner.calls.lock();
        let args = &calls[0].1;
        assert_eq!(args[2], "mon1:6789:/data");
        assert_eq!(args[5], "name=admin,secret=AQDdefault==");
    }

    #[test]
    fn test_unmount_only_after_last_consumer() {
        let f = fixture();
        f.keys.keys.lock().insert(CEPH_KEY_DESCRIPTION.to_string(), 11);
        let path = f.manager.mount("data", "c1").unwrap();
        f.manager.mount("data", "c2").unwrap();

        f.manager.unmount("data", "c1").unwrap();
        assert_eq!(f.runner.invocations("umount"), 0);
        assert_eq!(f.manager.count("data"), 1);
        assert!(f.manager.key_cached());

        f.manager.unmount("data", "c2").unwrap();
        assert_eq!(f.runner.invocations("umount"), 1);
        assert!(!path.exists());
        assert!(!f.manager.key_cached());
        assert!(f.manager.list().is_empty());
    }

    #[test]
    fn test_release_and_reacquire_mounts_twice() {
        let f = fixture();
        f.manager.mount("data", "c1").unwrap();
        f.manager.unmount("data", "c1").unwrap();
        f.manager.mount("data", "c2").unwrap();

        assert_eq!(f.runner.invocations("mount"), 2);
        assert_eq!(f.runner.invocations("umount"), 1);
        assert_eq!(f.manager.count("data"), 1);
    }

    #[test]
    fn test_unmount_unknown_is_noop() {
        let f = fixture();
        f.manager.unmount("ghost", "c1").unwrap();
        f.manager.unmount("ghost", "c1").unwrap();
        assert_eq!(f.runner.invocations("umount"), 0);
    }

    #[test]
    fn test_connections_track_outstanding_mounts() {
        let f = fixture();
        let mut outstanding: u32 = 0;
        let pattern = [true, true, false, true, false, false, false, true, false, false];
        for (i, attach) in pattern.iter().enumerate() {
            let id = format!("c{}", i);
            if *attach {
                f.manager.mount("data", &id).unwrap();
                outstanding += 1;
            } else {
                f.manager.unmount("data", &id).unwrap();
                outstanding = outstanding.saturating_sub(1);
            }
            assert_eq!(f.manager.count("data"), outstanding);
        }
    }

    #[test]
    fn test_concurrent_first_mount_mounts_once() {
        let f = fixture_with(FakeRunner {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let manager = Arc::new(f.manager);

        let paths: Vec<PathBuf> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let m = manager.clone();
                    s.spawn(move || m.mount("shared", &format!("c{}", i)).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(paths[0], paths[1]);
        assert_eq!(f.runner.invocations("mount"), 1);
        assert_eq!(manager.count("shared"), 2);
    }

    #[test]
    fn test_mount_failure_rolls_back() {
        let runner = FakeRunner::default();
        *runner.mount_failure.lock() =
            Some("mount error 13: access denied by server while mounting".to_string());
        let f = fixture_with(runner);

        let err = f.manager.mount("data", "c1").unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::AccessDenied));
        assert!(f.manager.list().is_empty());
        assert_eq!(f.manager.count("data"), 0);
        assert_eq!(f.runner.invocations("umount"), 0);
        // Created for the attempt, not removed afterwards
        assert!(f.root.path().join("data").is_dir());
    }

    #[test]
    fn test_mount_failure_keeps_managed_record() {
        let runner = FakeRunner::default();
        *runner.mount_failure.lock() = Some("mount error 110".to_string());
        let f = fixture_with(runner);

        f.manager.create("data", VolumeOptions::new()).unwrap();
        assert!(f.manager.mount("data", "c1").is_err());
        assert_eq!(f.manager.count("data"), 0);
        assert_eq!(f.manager.list().len(), 1);
    }

    #[test]
    fn test_conflicting_credentials_never_run_mount() {
        let f = fixture();
        let mut opts = VolumeOptions::new();
        opts.insert("secret".to_string(), "abc".to_string());
        opts.insert("secretfile".to_string(), "/path".to_string());
        f.manager.create("data", opts).unwrap();

        let err = f.manager.mount("data", "c1").unwrap_err();
        assert!(matches!(err, VolumeError::ConflictingCredentials));
        assert_eq!(f.runner.invocations("mount"), 0);
        assert_eq!(f.manager.count("data"), 0);
    }

    #[test]
    fn test_directory_conflict() {
        let f = fixture();
        std::fs::write(f.root.path().join("data"), b"file").unwrap();
        let err = f.manager.mount("data", "c1").unwrap_err();
        assert!(matches!(err, VolumeError::DirectoryConflict(_)));
        assert!(f.manager.list().is_empty());
        assert_eq!(f.runner.invocations("mount"), 0);
    }

    #[test]
    fn test_unmount_failure_restores_count() {
        let f = fixture();
        let path = f.manager.mount("data", "c1").unwrap();
        *f.runner.umount_failure.lock() = Some("umount: Device or resource busy".to_string());

        let err = f.manager.unmount("data", "c1").unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Busy));
        assert_eq!(f.manager.count("data"), 1);
        assert!(path.is_dir());

        *f.runner.umount_failure.lock() = None;
        f.manager.unmount("data", "c1").unwrap();
        assert!(f.manager.list().is_empty());
        assert_eq!(f.runner.invocations("umount"), 2);
    }

    #[test]
    fn test_create_then_remove() {
        let f = fixture();
        f.manager.create("data", VolumeOptions::new()).unwrap();
        assert_eq!(f.manager.get("data").unwrap().name, "data");
        assert_eq!(f.runner.invocations("mount"), 0);

        f.manager.remove("data").unwrap();
        assert!(matches!(f.manager.get("data"), Err(VolumeError::NotFound(_))));
    }

    #[test]
    fn test_remove_in_use_fails() {
        let f = fixture();
        f.manager.create("data", VolumeOptions::new()).unwrap();
        f.manager.mount("data", "c1").unwrap();

        let err = f.manager.remove("data").unwrap_err();
        assert!(matches!(err, VolumeError::InUse(_)));
        assert_eq!(f.manager.count("data"), 1);
        assert_eq!(f.manager.list().len(), 1);
    }

    #[test]
    fn test_managed_volume_survives_unmount() {
        let f = fixture();
        f.manager.create("data", VolumeOptions::new()).unwrap();
        f.manager.mount("data", "c1").unwrap();
        f.manager.unmount("data", "c1").unwrap();

        assert_eq!(f.manager.count("data"), 0);
        assert_eq!(f.manager.list().len(), 1);
        // Idle managed volume: a second unmount is a no-op
        f.manager.unmount("data", "c1").unwrap();
        assert_eq!(f.runner.invocations("umount"), 1);

        f.manager.remove("data").unwrap();
        assert!(f.manager.list().is_empty());
    }

    #[test]
    fn test_create_with_share_syntax() {
        let f = fixture();
        f.manager.create("mon9:6789:/exports#exports", VolumeOptions::new()).unwrap();
        assert!(f.manager.get("exports").is_ok());

        f.manager.mount("exports", "c1").unwrap();
        let calls = f.runner.calls.lock();
        assert_eq!(calls[0].1[2], "mon9:6789:/exports");
    }

    #[test]
    fn test_create_refreshes_options_of_active_volume() {
        let f = fixture();
        f.manager.mount("data", "c1").unwrap();
        let mut opts = VolumeOptions::new();
        opts.insert("cephopts".to_string(), "ro".to_string());
        f.manager.create("data", opts).unwrap();
        assert_eq!(f.manager.count("data"), 1);
    }

    #[test]
    fn test_path_and_invalid_names() {
        let f = fixture();
        assert_eq!(f.manager.path("data").unwrap(), f.root.path().join("data"));
        for bad in ["", "/etc", "../escape", "a/../../b"] {
            assert!(
                matches!(f.manager.mount(bad, "c1"), Err(VolumeError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(f.runner.invocations("mount"), 0);
    }

    #[test]
    fn test_name_aliases_share_one_mount() {
        let f = fixture();
        let path = f.manager.mount("data", "c1").unwrap();
        for alias in ["./data", "data/", "data//"] {
            assert_eq!(f.manager.mount(alias, "c2").unwrap(), path);
        }
        assert_eq!(f.runner.invocations("mount"), 1);
        assert_eq!(f.manager.count("data"), 4);
        assert_eq!(f.manager.list().len(), 1);

        for alias in ["./data", "data/", "data//"] {
            f.manager.unmount(alias, "c2").unwrap();
        }
        assert_eq!(f.runner.invocations("umount"), 0);
        assert_eq!(f.manager.count("data"), 1);
        assert!(path.is_dir());

        f.manager.unmount("data", "c1").unwrap();
        assert_eq!(f.runner.invocations("umount"), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_names_rejected_everywhere() {
        let f = fixture();
        for bad in ["", "/etc", "../escape"] {
            assert!(matches!(f.manager.unmount(bad, "c1"), Err(VolumeError::InvalidName(_))));
            assert!(matches!(f.manager.remove(bad), Err(VolumeError::InvalidName(_))));
            assert!(matches!(f.manager.get(bad), Err(VolumeError::InvalidName(_))));
            assert!(matches!(f.manager.path(bad), Err(VolumeError::InvalidName(_))));
            assert!(matches!(
                f.manager.create(bad, VolumeOptions::new()),
                Err(VolumeError::InvalidName(_))
            ));
        }
        assert_eq!(f.runner.invocations("umount"), 0);
    }

    #[test]
    fn test_reconciled_absolute_name_never_unmounted() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("keep"), b"data").unwrap();
        let refs = root.path().join("refs");
        std::fs::write(&refs, format!("{} 1\nmyvol 1\n", outside.path().display())).unwrap();

        let config = Config {
            logging: Default::default(),
            ceph: defaults(),
            mount_root: root.path().join("volumes"),
            reconcile: ReconcileConfig {
                script: None,
                refs_file: refs,
            },
        };
        let runner = Arc::new(FakeRunner::default());
        let manager = MountManager::start(&config, runner.clone(), Arc::new(FakeKeys::default()));
        assert_eq!(manager.list().len(), 1);

        let victim = outside.path().to_string_lossy().into_owned();
        assert!(matches!(manager.unmount(&victim, "c1"), Err(VolumeError::InvalidName(_))));
        assert_eq!(runner.invocations("umount"), 0);
        assert!(outside.path().join("keep").exists());
    }

    #[test]
    fn test_start_reconciles_before_serving() {
        let root = tempfile::tempdir().unwrap();
        let refs = root.path().join("refs");
        std::fs::write(&refs, "myvol 3\n").unwrap();

        let config = Config {
            logging: Default::default(),
            ceph: defaults(),
            mount_root: root.path().join("volumes"),
            reconcile: ReconcileConfig {
                script: None,
                refs_file: refs,
            },
        };
        let runner = Arc::new(FakeRunner::default());
        let manager = MountManager::start(&config, runner.clone(), Arc::new(FakeKeys::default()));

        assert_eq!(manager.count("myvol"), 3);
        assert_eq!(runner.invocations("mount"), 0);

        // Reconciled volume is shared, not remounted
        manager.mount("myvol", "c4").unwrap();
        assert_eq!(manager.count("myvol"), 4);
        assert_eq!(runner.invocations("mount"), 0);
    }
}
