//! Per-volume option keys and helpers
//!
//! Options arrive as a flat string map from the container runtime
//! (`docker volume create --opt key=value`).

use std::collections::HashMap;

/// Per-volume option map
pub type VolumeOptions = HashMap<String, String>;

/// Source override: mount this share instead of deriving it from the name
pub const SHARE: &str = "share";
/// Set on volumes created through the `share#name` syntax
pub const CREATE: &str = "create";
/// cephx user name
pub const NAME: &str = "name";
/// Inline cephx secret
pub const SECRET: &str = "secret";
/// File holding the cephx secret
pub const SECRET_FILE: &str = "secretfile";
/// Comma separated monitor addresses
pub const ADDR: &str = "addr";
/// Path inside the filesystem, appended to the monitor list
pub const DEVICE: &str = "device";
/// Monitor port
pub const PORT: &str = "port";
/// Extra mount options, comma separated
pub const CEPH_OPTIONS: &str = "cephopts";

/// Separator for the `share#name` volume name syntax
pub const SHARE_SEPARATOR: char = '#';

/// Overlay `overrides` on top of `defaults`; overrides win on collision.
pub fn merge(defaults: &VolumeOptions, overrides: &VolumeOptions) -> VolumeOptions {
    let mut merged = defaults.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Case-insensitive "yes"/"true" is true, anything else false
pub fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes") || value.eq_ignore_ascii_case("true")
}

/// Look up a key, treating an empty value as absent
pub fn non_empty<'a>(opts: &'a VolumeOptions, key: &str) -> Option<&'a str> {
    opts.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Split a `share#name` volume name.
///
/// Returns the bare volume name plus the options implied by the share part.
/// Names without the separator come back unchanged with no options.
pub fn resolve_name(name: &str) -> (String, Option<VolumeOptions>) {
    match name.split_once(SHARE_SEPARATOR) {
        Some((share, volume)) => {
            let mut opts = VolumeOptions::new();
            opts.insert(SHARE.to_string(), share.to_string());
            opts.insert(CREATE.to_string(), "true".to_string());
            (volume.to_string(), Some(opts))
        }
        None => (name.to_string(), None),
    }
}
