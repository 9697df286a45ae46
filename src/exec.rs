//! External mount/umount invocation
//!
//! The kernel client does the real work; this module only builds the command
//! line, runs it synchronously and turns the exit status and output into a
//! typed result.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use crate::credentials::MountSpec;
use crate::error::{FailureKind, Result, VolumeError};

/// Filesystem type passed to `mount -t`
pub const FS_TYPE: &str = "ceph";

/// Mode for mount point directories (rwxr-xr-x)
pub const MOUNT_DIR_MODE: u32 = 0o755;

/// Exit status and combined stdout/stderr of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            output: String::new(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Runs an external program to completion.
///
/// Implementations must block until the program exits; there is no timeout.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. `Err` means the program could not be started.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host with [`std::process::Command`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let out = Command::new(program).args(args).output()?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(CommandOutput {
            success: out.status.success(),
            output,
        })
    }
}

/// Known failure signatures, checked in order
static KNOWN_FAILURES: Lazy<Vec<(Regex, FailureKind)>> = Lazy::new(|| {
    [
        (r"(?i)access denied by server while mounting", FailureKind::AccessDenied),
        (r"(?i)failed to resolve server", FailureKind::ServerUnresolved),
        (r"(?i)device or resource busy", FailureKind::Busy),
    ]
    .into_iter()
    .map(|(pattern, kind)| (Regex::new(pattern).expect("valid failure pattern"), kind))
    .collect()
});

/// Classify the output of a failed mount or umount.
pub fn classify_output(output: &str) -> FailureKind {
    KNOWN_FAILURES
        .iter()
        .find(|(pattern, _)| pattern.is_match(output))
        .map(|(_, kind)| *kind)
        .unwrap_or(FailureKind::Other)
}

/// Make sure `dest` exists as a directory, creating it (0755) when missing.
pub fn ensure_mount_dir(dest: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(VolumeError::DirectoryConflict(dest.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Creating mount point directory {:?}", dest);
            create_dir_with_mode(dest)?;
            Ok(())
        }
        Err(e) => Err(VolumeError::Io(e)),
    }
}

#[cfg(unix)]
fn create_dir_with_mode(dest: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(MOUNT_DIR_MODE)
        .create(dest)
}

#[cfg(not(unix))]
fn create_dir_with_mode(dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)
}

/// Remove a mount point directory after a successful unmount
pub fn remove_mount_dir(dest: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VolumeError::Io(e)),
    }
}

/// Issues mount and umount commands through a [`CommandRunner`]
#[derive(Clone)]
pub struct MountExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl MountExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Arguments for `mount`, secret included
    pub fn mount_args(spec: &MountSpec) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            FS_TYPE.to_string(),
            spec.source.clone(),
            spec.target.to_string_lossy().into_owned(),
        ];
        let opts = spec.option_string();
        if !opts.is_empty() {
            args.push("-o".to_string());
            args.push(opts);
        }
        args
    }

    /// Mount `spec.source` on `spec.target`.
    ///
    /// The target directory must already exist.
    pub fn mount_volume(&self, spec: &MountSpec) -> Result<()> {
        let args = Self::mount_args(spec);
        debug!("exec: {}", spec.redact(&format!("mount {}", args.join(" "))));

        let out = self.runner.run("mount", &args)?;
        if out.success {
            info!("Mounted {} on {:?}", spec.source, spec.target);
            return Ok(());
        }

        let output = spec.redact(out.output.trim());
        let kind = classify_output(&output);
        error!("Mount of {} on {:?} failed ({}): {}", spec.source, spec.target, kind, output);
        Err(VolumeError::MountFailed { kind, output })
    }

    /// Unmount whatever is mounted at `target`.
    ///
    /// The caller removes the mount point directory afterwards.
    pub fn unmount_volume(&self, target: &Path) -> Result<()> {
        let args = vec![target.to_string_lossy().into_owned()];
        debug!("exec: umount {}", args[0]);

        let out = self.runner.run("umount", &args)?;
        if out.success {
            info!("Unmounted {:?}", target);
            return Ok(());
        }

        let output = out.output.trim().to_string();
        let kind = classify_output(&output);
        error!("Unmount of {:?} failed ({}): {}", target, kind, output);
        Err(VolumeError::UnmountFailed {
            path: target.to_path_buf(),
            kind,
            output,
        })
    }
}
