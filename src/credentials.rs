//! Mount credential and source resolution
//!
//! Turns a volume's stored options plus the daemon defaults into a fully
//! resolved [`MountSpec`]. The only I/O performed here is reading an optional
//! secret file.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{CephDefaults, DEFAULT_CEPH_PORT};
use crate::error::{Result, VolumeError};
use crate::options::{self, VolumeOptions};

/// Placeholder substituted for the secret in anything that gets logged
pub const REDACTED: &str = "****";

/// Everything the executor needs to run one mount
#[derive(Clone)]
pub struct MountSpec {
    /// Composite source, e.g. `10.0.0.1:6789,10.0.0.2:6789:/data`
    pub source: String,
    /// Local mount point
    pub target: PathBuf,
    /// cephx user, empty when none is configured
    pub username: String,
    /// cephx secret, empty when none is configured
    pub secret: String,
    /// Extra auth context option, passed through verbatim
    pub context: String,
    /// Extra mount options, comma separated
    pub extra_options: Option<String>,
}

impl MountSpec {
    /// The `-o` argument: context, user, secret, then extra options
    pub fn option_string(&self) -> String {
        self.build_options(&self.secret)
    }

    /// Same as [`option_string`](Self::option_string) with the secret masked
    pub fn redacted_option_string(&self) -> String {
        self.build_options(REDACTED)
    }

    /// Replace every occurrence of the secret in `text` with the placeholder
    pub fn redact(&self, text: &str) -> String {
        if self.secret.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.secret, REDACTED)
        }
    }

    fn build_options(&self, secret: &str) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.context.is_empty() {
            parts.push(self.context.clone());
        }
        if !self.username.is_empty() {
            parts.push(format!("name={}", self.username));
        }
        if !self.secret.is_empty() {
            parts.push(format!("secret={}", secret));
        }
        if let Some(extra) = self.extra_options.as_deref() {
            parts.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(String::from),
            );
        }
        parts.join(",")
    }
}

impl fmt::Debug for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSpec")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("options", &self.redacted_option_string())
            .finish()
    }
}

/// Resolves per-volume options against the daemon defaults
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    defaults: CephDefaults,
    default_options: VolumeOptions,
}

impl CredentialResolver {
    pub fn new(defaults: CephDefaults) -> Self {
        let mut default_options = VolumeOptions::new();
        if let Some(opts) = defaults.options.as_ref() {
            default_options.insert(options::CEPH_OPTIONS.to_string(), opts.clone());
        }
        Self {
            defaults,
            default_options,
        }
    }

    /// Build the mount spec for volume `name` mounted at `target`.
    ///
    /// Fails with [`VolumeError::ConflictingCredentials`] before touching the
    /// filesystem when both `secret` and `secretfile` are given.
    pub fn resolve(&self, name: &str, volume_opts: &VolumeOptions, target: &Path) -> Result<MountSpec> {
        let opts = options::merge(&self.default_options, volume_opts);

        let secret = self.secret(&opts)?;
        let username = options::non_empty(&opts, options::NAME)
            .map(String::from)
            .unwrap_or_else(|| self.defaults.username.clone());

        let source = self.source(name, &opts);
        debug!("Resolved source for {}: {}", name, source);

        Ok(MountSpec {
            source,
            target: target.to_path_buf(),
            username,
            secret,
            context: self.defaults.context.clone(),
            extra_options: options::non_empty(&opts, options::CEPH_OPTIONS).map(String::from),
        })
    }

    fn secret(&self, opts: &VolumeOptions) -> Result<String> {
        let inline = options::non_empty(opts, options::SECRET);
        let file = options::non_empty(opts, options::SECRET_FILE);

        match (inline, file) {
            (Some(_), Some(_)) => Err(VolumeError::ConflictingCredentials),
            (Some(secret), None) => Ok(secret.to_string()),
            (None, Some(path)) => read_secret_file(Path::new(path)),
            (None, None) => Ok(self.defaults.password.clone()),
        }
    }

    fn port(&self, opts: &VolumeOptions) -> String {
        match options::non_empty(opts, options::PORT) {
            Some(port) => port.to_string(),
            None if self.defaults.port != 0 => self.defaults.port.to_string(),
            None => DEFAULT_CEPH_PORT.to_string(),
        }
    }

    fn source(&self, name: &str, opts: &VolumeOptions) -> String {
        let port = self.port(opts);

        if let Some(addr) = options::non_empty(opts, options::ADDR) {
            let monitors: Vec<String> = addr
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(|a| format!("{}:{}", a, port))
                .collect();
            let device = options::non_empty(opts, options::DEVICE).unwrap_or_default();
            return format!("{}{}", monitors.join(","), device);
        }

        if let Some(share) = options::non_empty(opts, options::SHARE) {
            return share.to_string();
        }

        match name.split_once('/') {
            Some((host, path)) => format!("{}:{}:/{}", host, port, path),
            None if !self.defaults.endpoint.is_empty() => {
                format!("{}:{}:/{}", self.defaults.endpoint, port, name)
            }
            None => format!("{}:{}:/", name, port),
        }
    }
}

/// Read a secret file, trimming surrounding whitespace
fn read_secret_file(path: &Path) -> Result<String> {
    let data = std::fs::read_to_string(path).map_err(|source| VolumeError::SecretFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(data.trim().to_string())
}
