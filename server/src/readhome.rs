//! Privilege-separated read of a principal's `~/.ssh/auth_id`.
//!
//! The verify binary runs as the unprivileged `opksshuser`; the per-user
//! policy file lives in a home directory it cannot read. A single sudoers
//! NOPASSWD rule allows exactly `opkssh readhome <user>`, which prints the
//! file to stdout. The argument surface stays that narrow on purpose: this
//! is not a generic file-read helper.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tracing::debug;

use opkssh_common::{error::AuthError, fs::FileSystem};

use crate::policy::UserPolicyLoader;

/// Deadline for the sudo subprocess.
pub const READHOME_TIMEOUT: Duration = Duration::from_secs(10);

const PASSWD_PATH: &str = "/etc/passwd";

/// Reject anything that is not a plausible local username before it gets
/// near a subprocess argument or a path.
pub fn validate_principal(principal: &str) -> Result<(), AuthError> {
    let valid = !principal.is_empty()
        && principal.len() <= 32
        && !principal.starts_with('-')
        && principal
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AuthError::Malformed(format!(
            "invalid principal {principal:?}"
        )))
    }
}

/// Home directory per `/etc/passwd`.
fn home_dir(fs: &dyn FileSystem, principal: &str) -> Result<PathBuf, AuthError> {
    let raw = fs.read(Path::new(PASSWD_PATH))?;
    let text = String::from_utf8_lossy(&raw);
    for line in text.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(principal) {
            // user:pass:uid:gid:gecos:home:shell
            let home = fields
                .nth(4)
                .filter(|home| !home.is_empty())
                .ok_or_else(|| AuthError::Io(format!("{principal}: malformed passwd row")))?;
            return Ok(PathBuf::from(home));
        }
    }
    Err(AuthError::Io(format!("{principal}: no such user")))
}

/// The `readhome` subcommand body: print `~<principal>/.ssh/auth_id`.
///
/// Refuses symlinked and group/world-writable files so a user cannot point
/// the policy read outside their own home or let others edit it.
pub fn read_user_policy(fs: &dyn FileSystem, principal: &str) -> Result<String, AuthError> {
    validate_principal(principal)?;
    let path = home_dir(fs, principal)?.join(".ssh").join("auth_id");

    let meta = fs.metadata(&path)?;
    if meta.is_symlink {
        return Err(AuthError::Io(format!(
            "{}: refusing symlinked policy file",
            path.display()
        )));
    }
    if meta.mode & 0o022 != 0 {
        return Err(AuthError::Io(format!(
            "{}: policy file is writable by others (mode {:o})",
            path.display(),
            meta.mode
        )));
    }

    let raw = fs.read(&path)?;
    String::from_utf8(raw)
        .map_err(|_| AuthError::Malformed(format!("{}: not UTF-8", path.display())))
}

/// In-process loader, for tests and for runs that already have read access.
pub struct FsReadHome {
    fs: Arc<dyn FileSystem>,
}

impl FsReadHome {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl UserPolicyLoader for FsReadHome {
    async fn load(&self, principal: &str) -> Result<String, AuthError> {
        read_user_policy(self.fs.as_ref(), principal)
    }
}

/// Production loader: `sudo -n <bin> readhome <principal>`.
pub struct SudoReadHome {
    bin: PathBuf,
}

impl SudoReadHome {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }
}

#[async_trait]
impl UserPolicyLoader for SudoReadHome {
    async fn load(&self, principal: &str) -> Result<String, AuthError> {
        validate_principal(principal)?;
        debug!(principal, bin = %self.bin.display(), "invoking readhome helper");
        let output = tokio::time::timeout(
            READHOME_TIMEOUT,
            tokio::process::Command::new("sudo")
                .arg("-n")
                .arg(&self.bin)
                .arg("readhome")
                .arg(principal)
                .output(),
        )
        .await
        .map_err(|_| AuthError::IoTimeout("readhome helper deadline exceeded".into()))?
        .map_err(AuthError::io)?;

        if !output.status.success() {
            return Err(AuthError::Io(format!(
                "readhome helper failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| AuthError::Malformed("readhome output not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opkssh_common::fs::MemFs;

    fn fs_with_user(mode: u32) -> MemFs {
        let fs = MemFs::new();
        fs.insert(
            PASSWD_PATH,
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice:/home/alice:/bin/bash\n",
            0o644,
        );
        fs.insert(
            "/home/alice/.ssh/auth_id",
            "alice email u@test https://op.test/\n",
            mode,
        );
        fs
    }

    #[test]
    fn test_reads_user_policy() {
        let fs = fs_with_user(0o600);
        let text = read_user_policy(&fs, "alice").unwrap();
        assert_eq!(text, "alice email u@test https://op.test/\n");
    }

    #[test]
    fn test_rejects_world_writable_policy() {
        let fs = fs_with_user(0o666);
        let err = read_user_policy(&fs, "alice").unwrap_err();
        assert_eq!(err.code(), "io-error");
    }

    #[test]
    fn test_unknown_user_fails() {
        let fs = fs_with_user(0o600);
        let err = read_user_policy(&fs, "mallory").unwrap_err();
        assert_eq!(err.code(), "io-error");
    }

    #[test]
    fn test_principal_validation() {
        assert!(validate_principal("alice").is_ok());
        assert!(validate_principal("svc-deploy.01").is_ok());
        assert!(validate_principal("").is_err(), "empty");
        assert!(validate_principal("-rf").is_err(), "leading dash");
        assert!(validate_principal("a b").is_err(), "whitespace");
        assert!(validate_principal("a/b").is_err(), "path separator");
        assert!(
            validate_principal(&"x".repeat(33)).is_err(),
            "over-long name"
        );
    }
}
