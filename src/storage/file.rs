//! File system storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, XystonError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Disk-based storage rooted at a directory.
///
/// All file names are flat (no path separators); durability is provided by
/// per-file `fsync` through [`Storage::sync`].
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create (or open) a file storage rooted at `path`.
    ///
    /// The directory is created if it does not exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(FileStorage { root })
    }

    /// The root directory of this storage.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(XystonError::invalid_argument(format!(
                "invalid file name: '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.resolve(name)?;
        let file = File::open(&path)
            .map_err(|_| StorageError::FileNotFound(name.to_string()))?;
        let size = file.metadata()?.len();

        Ok(Box::new(FileInput {
            path,
            reader: BufReader::new(file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.resolve(name)?;
        let file = File::create(&path)?;

        Ok(Box::new(FileOutput {
            writer: BufWriter::new(file),
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.exists()).unwrap_or(false)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path)
            .map_err(|_| StorageError::FileNotFound(name.to_string()))?;
        Ok(meta.len())
    }

    fn sync(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        let file = File::open(&path)
            .map_err(|_| StorageError::FileNotFound(name.to_string()))?;
        file.sync_all()
            .map_err(|e| XystonError::sync_failed(name, e))
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let old_path = self.resolve(old_name)?;
        let new_path = self.resolve(new_name)?;
        fs::rename(old_path, new_path)?;
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let path = self.resolve(name)?;
        Ok(Box::new(FileLock {
            name: name.to_string(),
            path,
            held: false,
        }))
    }
}

#[derive(Debug)]
struct FileInput {
    path: PathBuf,
    reader: BufReader<File>,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(FileInput {
            path: self.path.clone(),
            reader: BufReader::new(file),
            size: self.size,
        }))
    }
}

#[derive(Debug)]
struct FileOutput {
    writer: BufWriter<File>,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.writer.seek(pos)
    }
}

impl StorageOutput for FileOutput {
    fn position(&mut self) -> Result<u64> {
        Ok(self.writer.stream_position()?)
    }

    fn flush_output(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// A lock file created with `O_EXCL` semantics.
///
/// A leftover lock file from a crashed process must be removed out of band;
/// the directory cleaner never touches a lock that is currently referenced.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    held: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_lock(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => {
                self.held = true;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        if self.held {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.held = false;
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}
