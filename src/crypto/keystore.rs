//! Persistence of the current and retiring key pairs
//!
//! The file layout is `<dir>/<base>.crt` / `<dir>/<base>.pub` for the current
//! pair and `<dir>/<base>_old.crt` / `<dir>/<base>_old.pub` for the single
//! retiring generation. New files are written under a temporary name and
//! renamed into place. Readers hold a shared lock on `<dir>/<base>.lock` and
//! rotation holds it exclusively, so nobody sees the window in which the
//! current pair has been retired but its replacement is not yet written.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::SecRestResult;

/// PEM text of one key pair as found in storage
#[derive(Clone)]
pub struct StoredKeyPair {
    pub private_pem: Zeroizing<String>,
    pub public_pem: String,
    /// Oldest modification time of the two files
    pub modified: SystemTime,
}

impl std::fmt::Debug for StoredKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("public_pem", &self.public_pem)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

/// Both generations, either of which may be absent
#[derive(Debug, Clone, Default)]
pub struct StoredKeys {
    pub current: Option<StoredKeyPair>,
    pub previous: Option<StoredKeyPair>,
}

/// Result of a compare-and-rotate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The fresh pair is now current and the old current is retiring
    Rotated,
    /// Someone else replaced the current pair first; nothing was written
    Superseded,
}

/// Storage backend for key material
pub trait KeyStore {
    /// Read whatever pairs are present
    fn load(&self) -> SecRestResult<StoredKeys>;

    /// Install `private_pem`/`public_pem` as the current pair.
    ///
    /// The store only rotates if its current public key still equals
    /// `expected_current` (`None` meaning "no current pair"). On success the
    /// previous current pair becomes the retiring pair and any older retiring
    /// pair is discarded.
    fn rotate(
        &self,
        expected_current: Option<&str>,
        private_pem: &str,
        public_pem: &str,
    ) -> SecRestResult<RotateOutcome>;

    /// Human readable location for logs
    fn location(&self) -> String;
}

/// What the two files of one generation look like on disk
enum PairFiles {
    Absent,
    /// Only one of the two files exists, left behind by an interrupted rotation
    Partial,
    Complete(StoredKeyPair),
}

impl PairFiles {
    fn into_pair(self, store: &FileKeyStore, generation: &str) -> Option<StoredKeyPair> {
        match self {
            PairFiles::Complete(pair) => Some(pair),
            PairFiles::Partial => {
                warn!(store = %store.location(), generation, "incomplete key pair on disk, ignoring it");
                None
            }
            PairFiles::Absent => None,
        }
    }
}

/// Advisory lock on the store's lock file, released on drop
struct KeyLock {
    #[cfg_attr(not(unix), allow(dead_code))]
    file: File,
}

impl KeyLock {
    #[cfg(unix)]
    fn acquire(path: &Path, exclusive: bool) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Blocks until the other holders are done
        let operation = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        if unsafe { libc::flock(file.as_raw_fd(), operation) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { file })
    }

    #[cfg(not(unix))]
    fn acquire(path: &Path, _exclusive: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }
}

#[cfg(unix)]
impl Drop for KeyLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Key store backed by files in a directory
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    directory: PathBuf,
    base_name: String,
}

impl FileKeyStore {
    pub fn new<P: AsRef<Path>>(directory: P, base_name: &str) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            base_name: base_name.to_string(),
        }
    }

    fn path(&self, suffix: &str, extension: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}.{}", self.base_name, suffix, extension))
    }

    fn current_paths(&self) -> (PathBuf, PathBuf) {
        (self.path("", "crt"), self.path("", "pub"))
    }

    fn previous_paths(&self) -> (PathBuf, PathBuf) {
        (self.path("_old", "crt"), self.path("_old", "pub"))
    }

    fn lock(&self, exclusive: bool) -> SecRestResult<KeyLock> {
        Ok(KeyLock::acquire(&self.path("", "lock"), exclusive)?)
    }

    fn read_pair(private_path: &Path, public_path: &Path) -> SecRestResult<PairFiles> {
        match (private_path.exists(), public_path.exists()) {
            (false, false) => return Ok(PairFiles::Absent),
            (true, true) => {}
            _ => return Ok(PairFiles::Partial),
        }

        let private_pem = Zeroizing::new(fs::read_to_string(private_path)?);
        let public_pem = fs::read_to_string(public_path)?;
        let modified = fs::metadata(private_path)?
            .modified()?
            .min(fs::metadata(public_path)?.modified()?);

        Ok(PairFiles::Complete(StoredKeyPair {
            private_pem,
            public_pem,
            modified,
        }))
    }

    fn remove_if_present(path: &Path) -> SecRestResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temporary file, then rename over `target`
    fn write_atomically(target: &Path, contents: &str, private: bool) -> SecRestResult<()> {
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, contents)?;

        if private {
            restrict_permissions(&tmp)?;
        }
        fs::rename(&tmp, target)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> SecRestResult<StoredKeys> {
        let _lock = self.lock(false)?;
        let (crt, public) = self.current_paths();
        let (old_crt, old_public) = self.previous_paths();
        Ok(StoredKeys {
            current: Self::read_pair(&crt, &public)?.into_pair(self, "current"),
            previous: Self::read_pair(&old_crt, &old_public)?.into_pair(self, "retiring"),
        })
    }

    fn rotate(
        &self,
        expected_current: Option<&str>,
        private_pem: &str,
        public_pem: &str,
    ) -> SecRestResult<RotateOutcome> {
        let _lock = self.lock(true)?;
        let (crt, public) = self.current_paths();
        let (old_crt, old_public) = self.previous_paths();

        // Compare against what is on disk now, not what the caller loaded
        let on_disk = Self::read_pair(&crt, &public)?;
        let observed = match &on_disk {
            PairFiles::Complete(pair) => Some(pair.public_pem.trim()),
            _ => None,
        };
        if observed != expected_current.map(str::trim) {
            debug!(store = %self.location(), "current key pair changed underneath us, not rotating");
            return Ok(RotateOutcome::Superseded);
        }

        let retired = match on_disk {
            PairFiles::Complete(_) => {
                Self::remove_if_present(&old_public)?;
                Self::remove_if_present(&old_crt)?;
                fs::rename(&crt, &old_crt)?;
                fs::rename(&public, &old_public)?;
                true
            }
            PairFiles::Partial => {
                // Leftover of an interrupted rotation; the retiring pair stays
                warn!(store = %self.location(), "replacing incomplete current key pair");
                Self::remove_if_present(&crt)?;
                Self::remove_if_present(&public)?;
                false
            }
            PairFiles::Absent => false,
        };

        Self::write_atomically(&crt, private_pem, true)?;
        Self::write_atomically(&public, public_pem, false)?;

        info!(store = %self.location(), retired, "installed new key pair");
        Ok(RotateOutcome::Rotated)
    }

    fn location(&self) -> String {
        self.directory.join(&self.base_name).display().to_string()
    }
}
