// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Filesystem helpers for the durable state files.
//!
//! Both the project catalog and the API-key store are small JSON files that must never be
//! world-readable and must never be observed half-written. The helpers here implement the two
//! rules every writer follows: owner-only permissions and write-to-temp-then-rename.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

/// Permission bits allowed on private state files (owner read/write only).
#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o600;

/// Returns an error if `path` is readable or writable by anyone but its owner.
///
/// A stricter mode than 0600 (e.g. 0400) is accepted; any group or other bit is not.
pub fn check_private_mode(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!(
                    "'{}' has mode {:03o}, refusing anything more permissive than {:03o}",
                    path.display(),
                    mode,
                    PRIVATE_MODE
                ),
            ));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Atomically replaces `path` with `contents`, with owner-only permissions.
///
/// The contents are written to a temporary sibling first, so a crash can never leave a partial
/// file behind.
pub fn write_private_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' has no parent directory", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".barry-tmp-")
        .tempfile_in(parent)?;
    tmp.write_all(contents)?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(PRIVATE_MODE))?;
    }

    tmp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_check_roundtrip() -> barry_test_utils::Result {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.db");

        write_private_atomic(&path, b"{}")?;
        check_private_mode(&path)?;
        assert_eq!(fs::read(&path)?, b"{}");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rejects_group_readable_file() -> barry_test_utils::Result {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.db");
        fs::write(&path, b"{}")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640))?;

        assert!(check_private_mode(&path).is_err());
        Ok(())
    }
}
