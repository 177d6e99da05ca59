use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use super::{text_hash, Resource};
use crate::system::{FilePerms, System};

/// Mosquitto password file holding one hashed credential.
///
/// `mosquitto_passwd -U` hashes the file in place, so the on-disk content
/// never matches the plaintext. The check only looks for the user's line and
/// the credential itself lives in the fingerprint.
#[derive(Debug, Clone)]
pub struct MosquittoPassword {
    path: PathBuf,
    username: String,
    password: String,
}

impl MosquittoPassword {
    pub fn new(
        path: impl Into<PathBuf>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Resource for MosquittoPassword {
    fn check(&self, sys: &dyn System) -> Result<bool> {
        let Some(content) = sys.read_file(&self.path)? else {
            return Ok(false);
        };
        let prefix = format!("{}:", self.username);
        Ok(String::from_utf8_lossy(&content)
            .lines()
            .any(|line| line.starts_with(&prefix)))
    }

    fn apply(&self, sys: &dyn System) -> Result<()> {
        info!(user = %self.username, "Writing broker credentials");
        let plain = format!("{}:{}\n", self.username, self.password);
        let perms = FilePerms {
            mode: 0o640,
            owner: Some("root:mosquitto".into()),
        };
        sys.write_file(&self.path, plain.as_bytes(), &perms)?;
        let target = self.path.to_string_lossy();
        sys.run("mosquitto_passwd", &["-U", &*target])?;
        Ok(())
    }

    fn fingerprint(&self, _sys: &dyn System) -> Result<String> {
        Ok(text_hash(&format!("{}:{}", self.username, self.password)))
    }
}
