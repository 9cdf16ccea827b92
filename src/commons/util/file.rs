//! Helpers for the files kept under the data directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use log::trace;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::commons::error::Error;


/// Creates a sub dir if needed, return full path to it
pub fn sub_dir(base: &Path, name: &str) -> Result<PathBuf, Error> {
    let full_path = base.join(name);
    create_dir(&full_path)?;
    Ok(full_path)
}

pub fn create_dir(dir: &Path) -> Result<(), Error> {
    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|err| {
            Error::io(format!("could not create dir: {}", dir.display()), err)
        })?;
    }
    Ok(())
}

pub fn remove_dir_all(dir: &Path) -> Result<(), Error> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|err| {
            Error::io(
                format!("could not remove-all dir: {}", dir.display()), err
            )
        })?;
    }
    Ok(())
}

/// Renames a file or directory.
pub fn rename(from: &Path, to: &Path) -> Result<(), Error> {
    trace!("Renaming {} to {}", from.display(), to.display());
    fs::rename(from, to).map_err(|err| {
        Error::io(
            format!(
                "could not rename '{}' to '{}'", from.display(), to.display()
            ),
            err
        )
    })
}

/// Reads a file to Bytes
pub fn read(path: &Path) -> Result<Bytes, Error> {
    fs::read(path).map(Bytes::from).map_err(|err| {
        Error::io(format!("Could not read: '{}'", path.display()), err)
    })
}

/// Reads a file if it exists.
pub fn read_opt(path: &Path) -> Result<Option<Bytes>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(Error::io(format!("Could not read: '{}'", path.display()), err))
        }
    }
}

/// Saves a file atomically, creating parent dirs as needed.
///
/// The content is written to a temporary file next to the target first
/// and then moved into place, so a reader never sees a partial file.
pub fn save_atomic(content: &[u8], path: &Path) -> Result<(), Error> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    create_dir(parent)?;

    let mut tmp_file = NamedTempFile::new_in(parent).map_err(|err| {
        Error::io(
            format!("writing temp file failed for '{}'", path.display()),
            err
        )
    })?;
    tmp_file.write_all(content).map_err(|err| {
        Error::io(
            format!(
                "failed to write temp file '{}'",
                tmp_file.as_ref().display()
            ),
            err
        )
    })?;
    tmp_file.as_file().sync_all().map_err(|err| {
        Error::io(
            format!(
                "failed to sync temp file '{}'", tmp_file.as_ref().display()
            ),
            err
        )
    })?;
    tmp_file.persist(path).map_err(|err| {
        Error::io(
            format!(
                "failed to rename temp file '{}' to '{}'",
                err.file.path().display(),
                path.display()
            ),
            err.error,
        )
    })?;
    trace!("Saved file: {}", path.display());
    Ok(())
}

/// Serializes an object to pretty JSON and saves it atomically.
///
/// Returns the bytes written so that callers can derive checksums from
/// exactly what ended up on disk.
pub fn save_json<O: Serialize>(
    object: &O, path: &Path
) -> Result<Bytes, Error> {
    let json = serde_json::to_vec_pretty(object)?;
    save_atomic(&json, path)?;
    Ok(Bytes::from(json))
}

/// Loads a file and deserializes it as JSON, if the file exists.
pub fn load_json<O: DeserializeOwned>(
    path: &Path
) -> Result<Option<O>, Error> {
    match read_opt(path)? {
        Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            Error::other(format!(
                "Could not load json for file '{}': {err}", path.display()
            ))
        }),
        None => Ok(None),
    }
}

/// Deletes a file, not complaining if it is already gone.
pub fn delete_file(path: &Path) -> Result<(), Error> {
    trace!("Removing file: {}", path.display());
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(
            format!("Could not remove file: {}", path.display()), err
        )),
    }
}

/// Lists the files in a directory with the given extension.
///
/// Returns the file stems, sorted. A missing directory has no files.
pub fn list_stems_with_ext(dir: &Path, ext: &str) -> Result<Vec<String>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(err) => {
            return Err(Error::io(
                format!("Could not read directory: '{}'", dir.display()), err
            ))
        }
    };
    let mut res = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| {
            Error::io(
                format!("Could not read entry in '{}'", dir.display()), err
            )
        })?.path();
        let extension = path.extension().and_then(|e| e.to_str());
        if !path.is_file() || extension != Some(ext) {
            continue
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                res.push(stem.to_string())
            }
        }
    }
    res.sort();
    Ok(res)
}

/// Lists the entries directly under a directory whose name has a prefix.
pub fn list_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(Vec::new())
        }
        Err(err) => {
            return Err(Error::io(
                format!("Could not read directory: '{}'", dir.display()), err
            ))
        }
    };
    let mut res = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::io(
                format!("Could not read entry in '{}'", dir.display()), err
            )
        })?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            res.push(entry.path())
        }
    }
    res.sort();
    Ok(res)
}


//------------ FileLock ------------------------------------------------------

/// An exclusive lock on a file under the data directory.
///
/// Guards against two processes working on the same key configuration
/// and keystore.
#[derive(Debug)]
pub struct FileLock {
    lock: fd_lock::RwLock<File>,
    path: PathBuf,
}

impl FileLock {
    pub fn create(path: PathBuf) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            create_dir(parent)?;
        }

        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        let lock_file = options.open(&path).map_err(|err| {
            Error::io(
                format!("failed to open lock file '{}'", path.display()),
                err
            )
        })?;

        Ok(FileLock { lock: fd_lock::RwLock::new(lock_file), path })
    }

    /// Takes the lock without waiting.
    ///
    /// Fails if another process holds the lock.
    pub fn try_write(
        &mut self
    ) -> Result<fd_lock::RwLockWriteGuard<'_, File>, Error> {
        let path = self.path.display().to_string();
        self.lock.try_write().map_err(|err| {
            Error::other(format!(
                "Cannot get file lock '{path}', is another process \
                 using the data directory? ({err})"
            ))
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::test_under_tmp;

    #[test]
    fn save_atomic_replaces_content() {
        test_under_tmp(|dir| {
            let path = dir.join("sub").join("file.json");
            save_atomic(b"one", &path).unwrap();
            save_atomic(b"two", &path).unwrap();
            assert_eq!(read(&path).unwrap().as_ref(), b"two");

            // No temporary files are left behind.
            let names: Vec<_> = fs::read_dir(dir.join("sub")).unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(names.len(), 1);
        })
    }

    #[test]
    fn load_missing_json_is_none() {
        test_under_tmp(|dir| {
            let loaded: Option<Vec<String>> =
                load_json(&dir.join("missing.json")).unwrap();
            assert!(loaded.is_none());
        })
    }

    #[test]
    fn list_stems_skips_hidden_and_other_ext() {
        test_under_tmp(|dir| {
            save_atomic(b"", &dir.join("b.p12")).unwrap();
            save_atomic(b"", &dir.join("a.p12")).unwrap();
            save_atomic(b"", &dir.join(".softtoken.p12")).unwrap();
            save_atomic(b"", &dir.join("c.txt")).unwrap();
            assert_eq!(
                list_stems_with_ext(&dir, "p12").unwrap(),
                vec!["a".to_string(), "b".to_string()]
            );
        })
    }

    #[test]
    fn second_lock_fails() {
        test_under_tmp(|dir| {
            let mut first = FileLock::create(dir.join(".lock")).unwrap();
            let _guard = first.try_write().unwrap();
            let mut second = FileLock::create(dir.join(".lock")).unwrap();
            assert!(second.try_write().is_err());
        })
    }
}
