//! Content-addressed snapshots of input recordings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::JobError;

/// Stable identity of an input's content. Equality and hashing look at the
/// content digest only; `location` is where the bytes can be read from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub digest: String,
    pub size: u64,
    pub location: PathBuf,
}

impl PartialEq for SnapshotRef {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.size == other.size
    }
}

impl Eq for SnapshotRef {}

impl Hash for SnapshotRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
        self.size.hash(state);
    }
}

/// Hash a file's full content with blake3.
pub fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut f = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut f, &mut hasher)?;
    Ok((hasher.finalize().to_hex().to_string(), size))
}

/// Reference for the current content of `path`, located at `path`.
/// Nothing is written.
pub fn identify(path: &Path) -> Result<SnapshotRef, JobError> {
    let (digest, size) = digest_file(path).map_err(|e| JobError::unavailable(path, e))?;
    Ok(SnapshotRef {
        digest,
        size,
        location: path.to_path_buf(),
    })
}

/// Copy `src` into `dest` via a temp file in the same directory, so `dest`
/// is either absent or complete.
pub(crate) fn copy_atomic(src: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut reader = fs::File::open(src)?;
    io::copy(&mut reader, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Writer that hashes exactly the bytes it passes through.
struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream `reader` once into a temp file under `root`, then publish it at
/// `blob_path(digest)` where `digest` covers the bytes actually written.
/// An existing blob is reused only if its content matches its name.
pub(crate) fn store_blob(
    mut reader: impl Read,
    root: &Path,
    blob_path: impl Fn(&str) -> PathBuf,
) -> io::Result<(String, u64, PathBuf)> {
    fs::create_dir_all(root)?;
    let mut tmp = tempfile::NamedTempFile::new_in(root)?;
    let (digest, size) = {
        let mut writer = HashingWriter {
            inner: BufWriter::new(tmp.as_file_mut()),
            hasher: blake3::Hasher::new(),
        };
        let size = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        (writer.hasher.finalize().to_hex().to_string(), size)
    };

    let dest = blob_path(&digest);
    if dest.is_file() {
        match digest_file(&dest) {
            Ok((existing, _)) if existing == digest => return Ok((digest, size, dest)),
            _ => warn!(blob = %dest.display(), "blob does not match its digest; replacing"),
        }
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(&dest).map_err(|e| e.error)?;
    Ok((digest, size, dest))
}

pub struct SnapshotStore {
    root: PathBuf,
    keep_copies: bool,
    // digest -> original path, used when copies are disabled
    index: Mutex<HashMap<String, PathBuf>>,
}

impl SnapshotStore {
    /// `keep_copies` stores a private copy so the reference stays resolvable
    /// after the original file moves or disappears.
    pub fn open(root: impl Into<PathBuf>, keep_copies: bool) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            keep_copies,
            index: Mutex::new(HashMap::new()),
        })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..2]).join(format!("{digest}.mda"))
    }

    /// Compute the reference without persisting anything.
    pub fn identify(&self, path: &Path) -> Result<SnapshotRef, JobError> {
        identify(path)
    }

    /// With copies enabled the input is read once; the reference names the
    /// bytes that were stored, even if `path` changes meanwhile.
    pub fn snapshot(&self, path: &Path) -> Result<SnapshotRef, JobError> {
        if self.keep_copies {
            let file = fs::File::open(path).map_err(|e| JobError::unavailable(path, e))?;
            let (digest, size, location) = store_blob(file, &self.root, |d| self.blob_path(d))
                .map_err(|e| {
                    JobError::internal(format!("store snapshot of {}: {e}", path.display()))
                })?;
            debug!(digest = %digest, path = %path.display(), "stored snapshot");
            return Ok(SnapshotRef {
                digest,
                size,
                location,
            });
        }

        let snap = self.identify(path)?;
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index
            .entry(snap.digest.clone())
            .or_insert_with(|| path.to_path_buf());
        Ok(snap)
    }

    /// Where the content of `snap` can currently be read from.
    pub fn resolve(&self, snap: &SnapshotRef) -> Option<PathBuf> {
        let blob = self.blob_path(&snap.digest);
        if blob.exists() {
            return Some(blob);
        }
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.get(&snap.digest).filter(|p| p.exists()).cloned()
    }
}
