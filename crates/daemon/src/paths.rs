//! Per-instance state paths and session tokens.
//!
//! A daemon is keyed by its instance ID. The default instance uses the
//! base directory directly; any other ID gets `base/instances/<id>/`.
//! The directory holds the pid/port rendezvous files, the session token
//! (0600, regenerated each start) and the persistent browser state.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use bd_domain::error::{Error, Result};

pub const DEFAULT_INSTANCE: &str = "default";
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub instance_id: String,
    pub state_dir: PathBuf,
}

impl StatePaths {
    pub fn resolve(base_dir: &Path, instance_id: &str) -> Self {
        let state_dir = if instance_id == DEFAULT_INSTANCE {
            base_dir.to_path_buf()
        } else {
            base_dir.join("instances").join(instance_id)
        };
        Self {
            instance_id: instance_id.to_string(),
            state_dir,
        }
    }

    /// Create the state directory. Failure here is fatal for startup.
    pub fn ensure_created(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| Error::Fatal(format!("cannot create {}: {e}", self.state_dir.display())))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("manager.pid")
    }

    pub fn port_file(&self) -> PathBuf {
        self.state_dir.join("manager.port")
    }

    pub fn token_file(&self) -> PathBuf {
        self.state_dir.join("session.token")
    }

    pub fn browser_state_file(&self) -> PathBuf {
        self.state_dir.join("browser-state.json")
    }

    pub fn write_pid(&self) -> Result<()> {
        std::fs::write(self.pid_file(), std::process::id().to_string())?;
        Ok(())
    }

    pub fn write_port(&self, port: u16) -> Result<()> {
        std::fs::write(self.port_file(), port.to_string())?;
        Ok(())
    }

    pub fn read_port(&self) -> Result<u16> {
        let raw = std::fs::read_to_string(self.port_file())?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Other(format!("malformed port file: {raw:?}")))
    }

    /// Remove the pid/port rendezvous files. Missing files are fine.
    pub fn remove_runtime_files(&self) {
        for path in [self.pid_file(), self.port_file()] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove runtime file");
                }
            }
        }
    }

    /// Mint a fresh 256-bit session token, write it with mode 0600, and
    /// return the hex form.
    pub fn generate_token(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        getrandom::fill(&mut bytes)
            .map_err(|e| Error::Fatal(format!("system RNG unavailable: {e}")))?;
        let token = hex::encode(bytes);

        let path = self.token_file();
        std::fs::write(&path, &token)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(token)
    }

    pub fn read_token(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.token_file())?
            .trim()
            .to_string())
    }

    /// Compare a presented token against the one on disk, constant-time
    /// over SHA-256 digests. Any read failure counts as a mismatch.
    pub fn token_matches(&self, presented: &str) -> bool {
        let current = match self.read_token() {
            Ok(token) => token,
            Err(_) => return false,
        };
        let expected = Sha256::digest(current.as_bytes());
        let provided = Sha256::digest(presented.as_bytes());
        bool::from(expected.ct_eq(&provided))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_instance_uses_base_dir() {
        let paths = StatePaths::resolve(Path::new("/tmp/base"), DEFAULT_INSTANCE);
        assert_eq!(paths.state_dir, Path::new("/tmp/base"));
    }

    #[test]
    fn named_instance_is_nested() {
        let paths = StatePaths::resolve(Path::new("/tmp/base"), "worker-1");
        assert_eq!(paths.state_dir, Path::new("/tmp/base/instances/worker-1"));
    }

    #[test]
    fn pid_and_port_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::resolve(tmp.path(), DEFAULT_INSTANCE);
        paths.write_pid().unwrap();
        paths.write_port(3456).unwrap();
        assert_eq!(paths.read_port().unwrap(), 3456);

        paths.remove_runtime_files();
        assert!(!paths.pid_file().exists());
        assert!(!paths.port_file().exists());
        // Second removal is quiet.
        paths.remove_runtime_files();
    }

    #[test]
    fn token_is_64_hex_chars_and_regenerated() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::resolve(tmp.path(), DEFAULT_INSTANCE);
        let first = paths.generate_token().unwrap();
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(paths.read_token().unwrap(), first);

        let second = paths.generate_token().unwrap();
        assert_ne!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::resolve(tmp.path(), DEFAULT_INSTANCE);
        paths.generate_token().unwrap();
        let mode = std::fs::metadata(paths.token_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn token_matching_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::resolve(tmp.path(), DEFAULT_INSTANCE);
        let token = paths.generate_token().unwrap();
        assert!(paths.token_matches(&token));
        assert!(!paths.token_matches(""));
        assert!(!paths.token_matches(&token[..63]));
        assert!(!paths.token_matches(&format!("{token}0")));
    }

    #[test]
    fn missing_token_file_never_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = StatePaths::resolve(tmp.path(), DEFAULT_INSTANCE);
        assert!(!paths.token_matches("anything"));
    }
}
