//! Open-table management.
//!
//! Table readers are expensive to open (footer, index block, filter block),
//! so they live in a refcounted cache keyed by file number; data blocks go
//! through a second cache namespaced per table. Everything that reads a
//! table — point lookups, range scans, compaction inputs — goes through
//! here, and iterators pin the cache handle of the table they walk so the
//! file cannot be closed under them.
//!
//! Table files are built under a temp name and renamed into place once
//! finished, so a crash never leaves a half-written `.ldb` behind.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::{Cache, CacheHandle, CacheValue, Finalizer};
use crate::comparer::InternalComparer;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::iter::{DbIterator, EmptyIterator};
use crate::sstable::{TableReader, TableWriter};
use crate::storage::{FileDesc, FileKind, Storage};
use crate::version::{LevelFiles, TableFileMeta};

/// Namespace of table handles within the file cache.
const FILE_NS: u32 = 0;

/// Clones share the same caches.
#[derive(Clone)]
pub struct TableCache {
    storage: Arc<Storage>,
    icmp: InternalComparer,
    bits_per_key: u8,
    file_cache: Cache,
    block_cache: Cache,
}

impl TableCache {
    pub fn new(storage: Arc<Storage>, icmp: InternalComparer, opts: &Options) -> TableCache {
        TableCache {
            storage,
            icmp,
            bits_per_key: opts.bits_per_key,
            file_cache: Cache::new(opts.file_cache_capacity as i64),
            block_cache: Cache::new(opts.block_cache_capacity as i64),
        }
    }

    pub fn icmp(&self) -> &InternalComparer {
        &self.icmp
    }

    #[cfg(test)]
    pub(crate) fn block_cache(&self) -> &Cache {
        &self.block_cache
    }

    /// Opens (or fetches) the reader for a table file. The handle pins it.
    fn open_table(&self, meta: &TableFileMeta) -> Result<(CacheHandle, Arc<TableReader>)> {
        let mut key = [0u8; 8];
        LittleEndian::write_u64(&mut key, meta.num);
        let num = meta.num;
        let size = meta.size;
        let block_cache = self.block_cache.clone();

        let handle = self
            .file_cache
            .get(
                FILE_NS,
                &key,
                Some(Box::new(|| {
                    let fd = FileDesc::new(FileKind::Table, num);
                    let file = self.storage.open_file(fd)?;
                    let reader = Arc::new(TableReader::open(
                        file,
                        size,
                        num,
                        self.icmp.clone(),
                        self.bits_per_key,
                        self.block_cache.clone(),
                    )?);
                    // Closing the table also retires its cached blocks.
                    let finalizer: Finalizer = Box::new(move |_key, _value| {
                        block_cache.evict_namespace(num as u32);
                    });
                    let value: CacheValue = reader;
                    Ok((value, 1, Some(finalizer)))
                })),
            )?
            .expect("loader-backed cache get returned no handle");

        let reader = handle
            .value()
            .downcast::<TableReader>()
            .map_err(|_| Error::Invariant("file cache held a foreign value".to_string()))?;
        Ok((handle, reader))
    }

    /// First entry with key >= ikey in the given table, bloom-checked.
    pub fn find(&self, meta: &TableFileMeta, ikey: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (_handle, reader) = self.open_table(meta)?;
        reader.find(ikey, true)
    }

    /// Drops the cached reader for a deleted table file.
    pub fn evict(&self, num: u64) {
        let mut key = [0u8; 8];
        LittleEndian::write_u64(&mut key, num);
        self.file_cache.delete(FILE_NS, &key);
    }

    /// Iterator over one table, pinning its handle. Open errors surface on
    /// the first iterator call rather than here.
    pub fn table_iterator(&self, meta: &TableFileMeta) -> Box<dyn DbIterator> {
        match self.open_table(meta) {
            Ok((handle, reader)) => Box::new(PinnedTableIterator {
                iter: reader.iter(),
                _handle: handle,
            }),
            Err(err) => Box::new(EmptyIterator::with_error(err)),
        }
    }

    /// Iterator over a sorted, disjoint file run (one level >= 1).
    pub fn level_iterator(&self, files: LevelFiles) -> Box<dyn DbIterator> {
        Box::new(LevelIterator {
            cache: self.clone(),
            files,
            index: 0,
            current: None,
        })
    }
}

/// A table iterator plus the cache handle keeping its file open.
struct PinnedTableIterator {
    iter: crate::sstable::reader::TableIterator,
    _handle: CacheHandle,
}

impl DbIterator for PinnedTableIterator {
    fn first(&mut self) -> Result<bool> {
        self.iter.first()
    }

    fn next(&mut self) -> Result<bool> {
        self.iter.next()
    }

    fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.iter.seek(key)
    }

    fn valid(&self) -> bool {
        self.iter.valid()
    }

    fn key(&self) -> &[u8] {
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        self.iter.value()
    }
}

/// Walks the files of one level in order, opening them lazily.
struct LevelIterator {
    cache: TableCache,
    files: LevelFiles,
    index: usize,
    current: Option<Box<dyn DbIterator>>,
}

impl LevelIterator {
    fn open_current(&mut self) -> Result<()> {
        let meta = &self.files[self.index];
        let (handle, reader) = self.cache.open_table(meta)?;
        self.current = Some(Box::new(PinnedTableIterator {
            iter: reader.iter(),
            _handle: handle,
        }));
        Ok(())
    }

    /// Advances across file boundaries until an entry shows up.
    fn skip_exhausted(&mut self) -> Result<bool> {
        loop {
            if let Some(iter) = &self.current {
                if iter.valid() {
                    return Ok(true);
                }
            }
            if self.index + 1 >= self.files.len() {
                self.current = None;
                return Ok(false);
            }
            self.index += 1;
            self.open_current()?;
            let iter = self.current.as_mut().expect("iterator just opened");
            if iter.first()? {
                return Ok(true);
            }
        }
    }
}

impl DbIterator for LevelIterator {
    fn first(&mut self) -> Result<bool> {
        if self.files.is_empty() {
            return Ok(false);
        }
        self.index = 0;
        self.open_current()?;
        self.current
            .as_mut()
            .expect("iterator just opened")
            .first()?;
        self.skip_exhausted()
    }

    fn next(&mut self) -> Result<bool> {
        match &mut self.current {
            None => self.first(),
            Some(iter) => {
                iter.next()?;
                self.skip_exhausted()
            }
        }
    }

    fn seek(&mut self, ikey: &[u8]) -> Result<bool> {
        let icmp = self.cache.icmp.clone();
        // First file whose largest key admits the target.
        let idx = self
            .files
            .partition_point(|f| icmp.compare(&f.max_ikey, ikey) == std::cmp::Ordering::Less);
        if idx >= self.files.len() {
            self.current = None;
            return Ok(false);
        }
        self.index = idx;
        self.open_current()?;
        self.current
            .as_mut()
            .expect("iterator just opened")
            .seek(ikey)?;
        self.skip_exhausted()
    }

    fn valid(&self) -> bool {
        self.current.as_ref().is_some_and(|iter| iter.valid())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|iter| iter.key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.current
            .as_ref()
            .map(|iter| iter.value())
            .unwrap_or(&[])
    }
}

/// Builds one table file under a temp name; `finish` renames it into place
/// and returns its metadata.
pub struct TableFileBuilder {
    storage: Arc<Storage>,
    file: File,
    temp_fd: FileDesc,
    table_fd: FileDesc,
    writer: Option<TableWriter<BufWriter<File>>>,
    first_key: Option<Vec<u8>>,
    last_key: Vec<u8>,
}

impl TableFileBuilder {
    pub fn new(storage: Arc<Storage>, num: u64, opts: &Options) -> Result<Self> {
        let temp_fd = FileDesc::new(FileKind::Temp, num);
        let table_fd = FileDesc::new(FileKind::Table, num);
        let file = storage.create(temp_fd)?;
        let writer = TableWriter::new(
            BufWriter::new(file.try_clone()?),
            InternalComparer::new(opts.comparer.clone()),
            opts.block_size,
            opts.restart_interval,
            opts.bits_per_key,
        );
        Ok(Self {
            storage,
            file,
            temp_fd,
            table_fd,
            writer: Some(writer),
            first_key: None,
            last_key: Vec::new(),
        })
    }

    pub fn num(&self) -> u64 {
        self.table_fd.num
    }

    pub fn append(&mut self, ikey: &[u8], value: &[u8]) -> Result<()> {
        if self.first_key.is_none() {
            self.first_key = Some(ikey.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(ikey);
        self.writer
            .as_mut()
            .expect("builder already finished")
            .append(ikey, value)
    }

    pub fn bytes_estimate(&self) -> u64 {
        self.writer
            .as_ref()
            .map(|w| w.bytes_estimate())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.first_key.is_none()
    }

    /// Seals, fsyncs and renames the table into place.
    pub fn finish(mut self) -> Result<Arc<TableFileMeta>> {
        let size = self
            .writer
            .take()
            .expect("builder already finished")
            .finish()?;
        self.file.sync_all()?;
        self.storage.rename(self.temp_fd, self.table_fd)?;
        Ok(Arc::new(TableFileMeta {
            num: self.table_fd.num,
            size,
            min_ikey: self.first_key.take().expect("finishing an empty table"),
            max_ikey: std::mem::take(&mut self.last_key),
        }))
    }

    /// Drops the half-built temp file.
    pub fn abandon(mut self) {
        self.writer.take();
        let _ = self.storage.remove(self.temp_fd);
    }
}
