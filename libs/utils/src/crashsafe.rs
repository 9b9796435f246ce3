//! Filesystem helpers that make multi-step updates survive a crash.
//!
//! The pattern everywhere in the catalog is: write to a temporary name,
//! fsync the file, rename over the final name, fsync the parent directory.
//! The rename is the commit point.

use std::fs::{self, File};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

/// Similar to [`std::fs::create_dir`], except we fsync the created directory
/// and its parent.
pub fn create_dir(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let path = path.as_ref();
    fs::create_dir(path)?;
    fsync(path)?;
    if let Some(parent) = path.parent() {
        fsync(parent)?;
    }
    Ok(())
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all newly created
/// directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    let mut path = path.as_ref();
    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("non-directory found in path: {path}"),
                ));
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) => path = parent,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("can't find parent of path '{path}'"),
                ));
            }
        }
    }

    // Create directories from parent to child.
    for &path in dirs_to_create.iter().rev() {
        fs::create_dir(path)?;
    }

    // Fsync the created directories from child to parent.
    for &path in dirs_to_create.iter() {
        fsync(path)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(
    original_path: impl AsRef<Utf8Path>,
    suffix: &str,
) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.as_ref().with_extension(new_extension)
}

pub fn fsync_file_and_parent(file_path: &Utf8Path) -> io::Result<()> {
    let parent = file_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("File {file_path} has no parent"),
        )
    })?;

    fsync(file_path)?;
    fsync(parent)?;
    Ok(())
}

pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to open the file {path}: {e}")))
        .and_then(|file| {
            file.sync_all().map_err(|e| {
                io::Error::new(e.kind(), format!("Failed to sync file {path}: {e}"))
            })
        })
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to fsync file {path}: {e}")))
}

/// Rename a file with the durability of the rename itself guaranteed: the
/// source is fsynced first, and the parent directory of the destination after.
pub fn durable_rename(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    fsync(from)?;
    fs::rename(from, to)?;
    let parent = to.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{to} has no parent"))
    })?;
    fsync(parent)?;
    Ok(())
}

/// Writes a file to a temporary name, fsyncs it, and renames it into place.
/// This is the atomic-rewrite primitive for the catalog metadata files.
pub fn overwrite_file(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = path_with_suffix_extension(path, "tmp");
    fs::write(&tmp_path, content)?;
    durable_rename(&tmp_path, path)
}
