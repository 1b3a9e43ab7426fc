use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::flock::FileLock;

use super::{FileDesc, FileKind};

const CURRENT: &str = "CURRENT";
const CURRENT_BAK: &str = "CURRENT.bak";
const LOCK: &str = "LOCK";

/// Filesystem access for one database directory.
///
/// Holds the advisory lock for the life of the store (read-only opens skip
/// it). All mutating operations live here so the engine proper never
/// touches paths.
pub struct Storage {
    dir: PathBuf,
    _lock: Option<FileLock>,
}

impl Storage {
    pub fn open(dir: impl Into<PathBuf>, read_only: bool) -> Result<Self> {
        let dir = dir.into();
        if read_only {
            if !dir.is_dir() {
                return Err(Error::Io(format!("no such directory: {}", dir.display())));
            }
            return Ok(Self { dir, _lock: None });
        }
        fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK))?;
        Ok(Self {
            dir,
            _lock: Some(lock),
        })
    }

    pub fn path_of(&self, fd: FileDesc) -> PathBuf {
        self.dir.join(fd.file_name())
    }

    /// Creates (or truncates) a numbered file for writing.
    pub fn create(&self, fd: FileDesc) -> Result<File> {
        Ok(File::create(self.path_of(fd))?)
    }

    /// Opens a numbered file for reading.
    pub fn open_file(&self, fd: FileDesc) -> Result<File> {
        match File::open(self.path_of(fd)) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub fn size_of(&self, fd: FileDesc) -> Result<u64> {
        Ok(fs::metadata(self.path_of(fd))?.len())
    }

    pub fn remove(&self, fd: FileDesc) -> Result<()> {
        Ok(fs::remove_file(self.path_of(fd))?)
    }

    /// Atomically renames a numbered file; used to promote finished temp
    /// tables.
    pub fn rename(&self, from: FileDesc, to: FileDesc) -> Result<()> {
        Ok(fs::rename(self.path_of(from), self.path_of(to))?)
    }

    /// All files of a kind, unsorted.
    pub fn list(&self, kind: FileKind) -> Result<Vec<FileDesc>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(fd) = FileDesc::parse(name) {
                    if fd.kind == kind {
                        out.push(fd);
                    }
                }
            }
        }
        Ok(out)
    }

    /// fsync on the directory itself, ordering renames against a crash.
    pub fn sync_dir(&self) -> Result<()> {
        let dir = File::open(&self.dir)?;
        dir.sync_all()?;
        Ok(())
    }

    /// Points CURRENT at the given manifest:
    /// write-to-temp, fsync, back up the old CURRENT, rename, fsync dir.
    pub fn set_current(&self, manifest_num: u64) -> Result<()> {
        let content = format!("{}\n", FileDesc::new(FileKind::Manifest, manifest_num).file_name());
        let temp_path = self.dir.join(format!("{CURRENT}.{manifest_num:06}"));

        let mut temp = File::create(&temp_path)?;
        temp.write_all(content.as_bytes())?;
        temp.sync_all()?;
        drop(temp);

        let current_path = self.dir.join(CURRENT);
        if current_path.exists() {
            fs::rename(&current_path, self.dir.join(CURRENT_BAK))?;
        }
        fs::rename(&temp_path, &current_path)?;
        self.sync_dir()?;
        Ok(())
    }

    /// Resolves the active manifest. Prefers CURRENT, then the
    /// highest-numbered transient CURRENT.NNNNNN, then the backup; a
    /// candidate only counts if the manifest it names exists. NotFound
    /// means a fresh directory.
    pub fn current(&self) -> Result<FileDesc> {
        if let Some(fd) = self.read_current_file(&self.dir.join(CURRENT))? {
            return Ok(fd);
        }

        let mut transients: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(suffix) = name.strip_prefix("CURRENT.") {
                    if let Ok(num) = suffix.parse::<u64>() {
                        transients.push((num, entry.path()));
                    }
                }
            }
        }
        transients.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in transients {
            if let Some(fd) = self.read_current_file(&path)? {
                return Ok(fd);
            }
        }

        if let Some(fd) = self.read_current_file(&self.dir.join(CURRENT_BAK))? {
            return Ok(fd);
        }
        Err(Error::NotFound)
    }

    fn read_current_file(&self, path: &std::path::Path) -> Result<Option<FileDesc>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let name = content.trim_end_matches('\n');
        let fd = match FileDesc::parse(name) {
            Some(fd) if fd.kind == FileKind::Manifest => fd,
            _ => {
                return Err(Error::Corruption(format!(
                    "CURRENT names no manifest: {name:?}"
                )))
            }
        };
        if self.path_of(fd).exists() {
            Ok(Some(fd))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_create_open_remove() {
        let dir = TempDir::new().expect("tempdir failed");
        let storage = Storage::open(dir.path(), false).expect("open failed");

        let fd = FileDesc::new(FileKind::Journal, 1);
        let mut file = storage.create(fd).expect("create failed");
        file.write_all(b"payload").expect("write failed");
        drop(file);

        assert_eq!(storage.size_of(fd).expect("size failed"), 7);
        assert!(storage.open_file(fd).is_ok());
        storage.remove(fd).expect("remove failed");
        assert!(matches!(storage.open_file(fd), Err(Error::NotFound)));
    }

    #[test]
    fn test_list_by_kind() {
        let dir = TempDir::new().expect("tempdir failed");
        let storage = Storage::open(dir.path(), false).expect("open failed");

        for num in [3u64, 1, 2] {
            storage
                .create(FileDesc::new(FileKind::Journal, num))
                .expect("create failed");
        }
        storage
            .create(FileDesc::new(FileKind::Table, 9))
            .expect("create failed");

        let mut journals = storage.list(FileKind::Journal).expect("list failed");
        journals.sort_by_key(|fd| fd.num);
        let nums: Vec<u64> = journals.iter().map(|fd| fd.num).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn test_current_protocol() {
        let dir = TempDir::new().expect("tempdir failed");
        let storage = Storage::open(dir.path(), false).expect("open failed");

        // Fresh directory: nothing to point at.
        assert!(matches!(storage.current(), Err(Error::NotFound)));

        storage
            .create(FileDesc::new(FileKind::Manifest, 1))
            .expect("create failed");
        storage.set_current(1).expect("set_current failed");
        assert_eq!(
            storage.current().expect("current failed"),
            FileDesc::new(FileKind::Manifest, 1)
        );

        // Swap to a newer manifest; the backup preserves the old pointer.
        storage
            .create(FileDesc::new(FileKind::Manifest, 5))
            .expect("create failed");
        storage.set_current(5).expect("set_current failed");
        assert_eq!(
            storage.current().expect("current failed"),
            FileDesc::new(FileKind::Manifest, 5)
        );
        assert!(dir.path().join("CURRENT.bak").exists());
    }

    #[test]
    fn test_current_ignores_dangling_pointer() {
        let dir = TempDir::new().expect("tempdir failed");
        let storage = Storage::open(dir.path(), false).expect("open failed");

        // CURRENT names a manifest that does not exist; recovery must not
        // pick it.
        std::fs::write(dir.path().join("CURRENT"), "MANIFEST-000042\n").expect("write failed");
        assert!(matches!(storage.current(), Err(Error::NotFound)));

        // The backup still works.
        storage
            .create(FileDesc::new(FileKind::Manifest, 7))
            .expect("create failed");
        std::fs::write(dir.path().join("CURRENT.bak"), "MANIFEST-000007\n")
            .expect("write failed");
        assert_eq!(
            storage.current().expect("current failed"),
            FileDesc::new(FileKind::Manifest, 7)
        );
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = TempDir::new().expect("tempdir failed");
        let _storage = Storage::open(dir.path(), false).expect("open failed");
        assert!(Storage::open(dir.path(), false).is_err());
    }

    #[test]
    fn test_read_only_skips_lock() {
        let dir = TempDir::new().expect("tempdir failed");
        let _writer = Storage::open(dir.path(), false).expect("open failed");
        // A read-only open takes no lock and coexists with the writer.
        let _reader = Storage::open(dir.path(), true).expect("read-only open failed");
    }
}
