//! Best-effort ownership hand-off for files created while running under
//! `sudo` (SPEC_FULL.md §4.10). Never fails the caller's operation: a
//! chown failure is logged and swallowed, since ownership is a convenience
//! for interactive use, not a correctness requirement of the format.

/// A `(uid, gid)` pair to apply to a freshly created database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIds {
    pub uid: u32,
    pub gid: u32,
}

/// Read `SUDO_UID`/`SUDO_GID` from the environment. Returns `None` if
/// either is absent or fails to parse as `u32` - never panics.
pub fn sudo_owner_ids() -> Option<OwnerIds> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some(OwnerIds { uid, gid })
}

/// Apply `owner` to `path` via `chown`. No-op outside `cfg(unix)`. Logs and
/// swallows any failure.
pub fn apply_ownership(path: &std::path::Path, owner: OwnerIds) {
    #[cfg(unix)]
    {
        use std::ffi::CString;

        let Ok(c_path) = CString::new(path.as_os_str().as_encoded_bytes()) else {
            log::warn!("apply_ownership: path {} is not representable as a C string", path.display());
            return;
        };
        let rc = unsafe { libc::chown(c_path.as_ptr(), owner.uid, owner.gid) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            log::warn!(
                "apply_ownership: chown({}, {}, {}) failed: {err}",
                path.display(),
                owner.uid,
                owner.gid
            );
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sudo_env_yields_none() {
        std::env::remove_var("SUDO_UID");
        std::env::remove_var("SUDO_GID");
        assert_eq!(sudo_owner_ids(), None);
    }

    #[test]
    fn malformed_sudo_env_yields_none() {
        std::env::set_var("SUDO_UID", "not-a-number");
        std::env::set_var("SUDO_GID", "1000");
        assert_eq!(sudo_owner_ids(), None);
        std::env::remove_var("SUDO_UID");
        std::env::remove_var("SUDO_GID");
    }

    #[test]
    fn valid_sudo_env_parses() {
        std::env::set_var("SUDO_UID", "1000");
        std::env::set_var("SUDO_GID", "1001");
        assert_eq!(sudo_owner_ids(), Some(OwnerIds { uid: 1000, gid: 1001 }));
        std::env::remove_var("SUDO_UID");
        std::env::remove_var("SUDO_GID");
    }
}
