//! Scoped storage for the decrypted private key.
//!
//! The plaintext key only ever lives in a [`DecryptedKey`]. The backing file is
//! created owner-only inside the scratch directory, overwritten with zeros and
//! unlinked when the guard goes away, whichever path that happens on.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, warn};

use crate::error::{ToolError, ToolResult};
use crate::runner::CommandRunner;

const ZEROS: [u8; 4096] = [0u8; 4096];

/// Plaintext private key staged on disk for the length of one tool call.
#[derive(Debug)]
pub struct DecryptedKey {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl DecryptedKey {
    /// Decrypt `encrypted` into a fresh temporary file.
    ///
    /// The guard exists before the decryption tool runs, so a failed or
    /// partial decryption is wiped and removed before the error is returned.
    pub async fn decrypt<R>(
        runner: &R,
        encrypted: &Path,
        scratch_dir: Option<&Path>,
    ) -> ToolResult<Self>
    where
        R: CommandRunner + ?Sized,
    {
        let mut builder = Builder::new();
        builder.prefix(".tempjwk-").suffix(".key");
        let file = match scratch_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| ToolError::io("failed to create temporary key file", e))?;
        restrict_permissions(file.path())
            .map_err(|e| ToolError::io("failed to restrict temporary key file", e))?;

        let sink = file
            .as_file()
            .try_clone()
            .map_err(|e| ToolError::io("failed to open temporary key file", e))?;
        let key = Self {
            path: file.path().to_path_buf(),
            file: Some(file),
        };

        runner.decrypt(encrypted, sink).await?;
        debug!(path = %key.path().display(), "Private key decrypted");
        Ok(key)
    }

    /// Location of the plaintext key.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wipe and remove the key now, reporting failures instead of swallowing them.
    pub fn destroy(mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                let wiped = wipe(file.as_file());
                file.close()?;
                wiped
            }
            None => Ok(()),
        }
    }
}

impl Drop for DecryptedKey {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = wipe(file.as_file()) {
                warn!(path = %self.path.display(), "Failed to wipe temporary key: {}", e);
            }
            if let Err(e) = file.close() {
                warn!("Failed to remove temporary key: {}", e);
            }
        }
    }
}

/// Overwrite the whole file with zeros.
fn wipe(mut file: &File) -> io::Result<()> {
    let mut remaining = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        file.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
