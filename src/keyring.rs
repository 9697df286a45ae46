//! Kernel keyring cleanup
//!
//! The ceph kernel client caches the cephx secret in the user keyring. After
//! the last unmount we drop that key so a later mount under a different
//! identity cannot pick up the stale one.

use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

/// Key type the ceph client registers its secrets under
pub const CEPH_KEY_TYPE: &str = "ceph";

/// Description of the cached cephx key
pub const CEPH_KEY_DESCRIPTION: &str = "client.cephFS";

/// Serial number of a key in the kernel keyring
pub type KeySerial = i32;

/// Narrow view of the kernel credential cache
pub trait KeyCache: Send + Sync {
    /// Find a key by type and description. `Ok(None)` if there is no such key.
    fn search(&self, key_type: &str, description: &str) -> io::Result<Option<KeySerial>>;

    /// Unlink a key from the keyring it was found in
    fn unlink(&self, key: KeySerial) -> io::Result<()>;
}

/// `keyctl(2)` against the calling user's keyring
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelKeyring;

#[cfg(target_os = "linux")]
mod sys {
    pub const KEY_SPEC_USER_KEYRING: libc::c_long = -4;
    pub const KEYCTL_UNLINK: libc::c_long = 9;
    pub const KEYCTL_SEARCH: libc::c_long = 10;
}

#[cfg(target_os = "linux")]
impl KeyCache for KernelKeyring {
    fn search(&self, key_type: &str, description: &str) -> io::Result<Option<KeySerial>> {
        let key_type = to_cstring(key_type)?;
        let description = to_cstring(description)?;

        // SAFETY: both pointers reference NUL-terminated strings that outlive the call;
        // a zero destination keyring means the result is not linked anywhere.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_keyctl,
                sys::KEYCTL_SEARCH,
                sys::KEY_SPEC_USER_KEYRING,
                key_type.as_ptr(),
                description.as_ptr(),
                0 as libc::c_long,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOKEY) | Some(libc::EKEYEXPIRED) | Some(libc::EKEYREVOKED) => Ok(None),
                _ => Err(err),
            };
        }

        Ok(Some(ret as KeySerial))
    }

    fn unlink(&self, key: KeySerial) -> io::Result<()> {
        // SAFETY: KEYCTL_UNLINK only takes integer arguments.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_keyctl,
                sys::KEYCTL_UNLINK,
                key as libc::c_long,
                sys::KEY_SPEC_USER_KEYRING,
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Stand-in for hosts without a kernel keyring; never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeyring;

impl KeyCache for NoKeyring {
    fn search(&self, _key_type: &str, _description: &str) -> io::Result<Option<KeySerial>> {
        Ok(None)
    }

    fn unlink(&self, _key: KeySerial) -> io::Result<()> {
        Ok(())
    }
}

/// The platform's key cache
pub fn host_key_cache() -> Arc<dyn KeyCache> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(KernelKeyring)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NoKeyring)
    }
}

#[cfg(target_os = "linux")]
fn to_cstring(s: &str) -> io::Result<std::ffi::CString> {
    std::ffi::CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Looks up and drops the cached ceph key
#[derive(Clone)]
pub struct KeyringCleaner {
    cache: Arc<dyn KeyCache>,
}

impl KeyringCleaner {
    pub fn new(cache: Arc<dyn KeyCache>) -> Self {
        Self { cache }
    }

    /// Whether a ceph key with this description is cached
    pub fn is_key_present(&self, key_name: &str) -> bool {
        match self.cache.search(CEPH_KEY_TYPE, key_name) {
            Ok(Some(serial)) => {
                debug!("Found key {} with serial {}", key_name, serial);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Key search for {} failed: {}", key_name, e);
                false
            }
        }
    }

    /// Remove the key if present. Never fails; problems are only logged.
    pub fn unlink_key(&self, key_name: &str) {
        let serial = match self.cache.search(CEPH_KEY_TYPE, key_name) {
            Ok(Some(serial)) => serial,
            Ok(None) => {
                debug!("No cached key {} to unlink", key_name);
                return;
            }
            Err(e) => {
                debug!("Key search for {} failed: {}", key_name, e);
                return;
            }
        };

        match self.cache.unlink(serial) {
            Ok(()) => debug!("Unlinked key {} ({})", key_name, serial),
            Err(e) => warn!("Failed to unlink key {} ({}): {}", key_name, serial, e),
        }
    }
}
