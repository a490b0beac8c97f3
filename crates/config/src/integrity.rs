//! Startup integrity gate: SHA-256 verification of the runtime binaries.
//!
//! In production mode the shell interpreter and the preload sandbox library
//! must match the hashes stored in the root-owned config file. Mismatch or
//! a missing hash aborts startup with a remediation message. The shell
//! check has a config-file-only escape hatch (`WARDSH_SKIP_SHELL_HASH`);
//! the sandbox library check has none.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{Config, Mode, SHELL_PATH};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("{path} not found. {hint}")]
    Missing { path: String, hint: String },

    #[error("{path} is not accessible: {hint}")]
    Inaccessible { path: String, hint: String },

    #[error("no expected hash for {path} in /etc/wardsh/config. Set {key} to the verified SHA-256 of the binary.")]
    NoExpectedHash { path: String, key: String },

    #[error(
        "{path} hash mismatch.\n  Expected: {expected}\n  Actual:   {actual}\n\
         Step 1 — Verify the binary is a legitimate package update:\n\
         \x20 dpkg --verify {package}   # Debian/Ubuntu — no output means OK\n\
         \x20 rpm -V {package}          # RHEL/CentOS  — no output means OK\n\
         Step 2 — Only after verification, update the stored hash:\n\
         \x20 sudo sed -i 's/^{key}=.*/{key}={actual}/' /etc/wardsh/config"
    )]
    HashMismatch {
        path: String,
        package: String,
        key: String,
        expected: String,
        actual: String,
    },

    #[error("cannot read {path} for hash verification: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
}

/// Hex SHA-256 of a file, streamed in 8 KiB chunks.
pub fn compute_file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    use std::fmt::Write as _;
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

fn verify_hash(
    path: &Path,
    package: &str,
    key: &str,
    expected: Option<String>,
) -> Result<(), IntegrityError> {
    let display = path.display().to_string();
    let expected = match expected {
        Some(hash) if !hash.trim().is_empty() => hash.trim().to_ascii_lowercase(),
        _ => {
            return Err(IntegrityError::NoExpectedHash {
                path: display,
                key: key.to_string(),
            });
        }
    };
    let actual = compute_file_sha256(path).map_err(|source| IntegrityError::Unreadable {
        path: display.clone(),
        source,
    })?;
    if actual != expected {
        return Err(IntegrityError::HashMismatch {
            path: display,
            package: package.to_string(),
            key: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl Config {
    /// Verify the shell interpreter exists, is executable, and (in
    /// production mode, unless skipped) matches its configured hash.
    ///
    /// Returns a short status message on success.
    pub fn validate_shell_binary(&self) -> Result<String, IntegrityError> {
        use std::os::unix::fs::PermissionsExt;

        let path = Path::new(SHELL_PATH);
        let metadata = std::fs::metadata(path).map_err(|_| IntegrityError::Missing {
            path: SHELL_PATH.to_string(),
            hint: "This system has no bash.".to_string(),
        })?;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(IntegrityError::Inaccessible {
                path: SHELL_PATH.to_string(),
                hint: format!("not executable. Fix with: sudo chmod +x {SHELL_PATH}"),
            });
        }

        if self.mode() == Mode::Production {
            if self.skip_shell_hash() {
                return Ok(format!("shell hash check skipped for {SHELL_PATH} (WARDSH_SKIP_SHELL_HASH)"));
            }
            verify_hash(path, "bash", "WARDSH_SHELL_HASH", self.get("WARDSH_SHELL_HASH"))?;
            return Ok(format!("shell binary verified at {SHELL_PATH}"));
        }

        Ok(format!("shell binary present at {SHELL_PATH}"))
    }

    /// Verify the preload sandbox library exists, is readable, and (in
    /// production mode) matches its configured hash. This check is never
    /// bypassable.
    pub fn validate_sandboxer_library(&self) -> Result<String, IntegrityError> {
        let path = self.sandboxer_path();
        let display = path.display().to_string();

        if !path.exists() {
            return Err(IntegrityError::Missing {
                path: display,
                hint: "Build and install the sandbox library, then retry.".to_string(),
            });
        }
        if File::open(&path).is_err() {
            return Err(IntegrityError::Inaccessible {
                path: display.clone(),
                hint: format!("not readable. Fix with: sudo chmod +r {display}"),
            });
        }

        if self.mode() == Mode::Production {
            verify_hash(
                &path,
                "wardsh-sandboxer",
                "WARDSH_SANDBOXER_HASH",
                self.get("WARDSH_SANDBOXER_HASH"),
            )?;
            return Ok(format!("sandbox library verified at {display}"));
        }

        Ok(format!("sandbox library ready at {display}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha256_of_known_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello\n").unwrap();
        let hash = compute_file_sha256(file.path()).unwrap();
        // sha256sum of "hello\n"
        assert_eq!(
            hash,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn sha256_streams_large_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xabu8; 40_000]).unwrap();
        let hash = compute_file_sha256(file.path()).unwrap();
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn verify_hash_accepts_match_case_insensitively() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        let actual = compute_file_sha256(file.path()).unwrap();
        assert!(verify_hash(file.path(), "pkg", "KEY", Some(actual.to_ascii_uppercase())).is_ok());
    }

    #[test]
    fn verify_hash_rejects_mismatch_with_remediation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        let err = verify_hash(file.path(), "bash", "WARDSH_SHELL_HASH", Some("deadbeef".into()))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("hash mismatch"));
        assert!(msg.contains("WARDSH_SHELL_HASH="));
        assert!(msg.contains("dpkg --verify bash"));
    }

    #[test]
    fn verify_hash_requires_expected_value() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = verify_hash(file.path(), "pkg", "KEY", None).unwrap_err();
        assert!(matches!(err, IntegrityError::NoExpectedHash { .. }));
        let err = verify_hash(file.path(), "pkg", "KEY", Some("  ".into())).unwrap_err();
        assert!(matches!(err, IntegrityError::NoExpectedHash { .. }));
    }
}
