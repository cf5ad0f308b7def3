use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::{cmp, io};

use parking_lot::Mutex;

/// A read-only random-access byte source backing a cache.
///
/// The store is immutable for the lifetime of the cache. Implementations
/// never surface I/O failures across this boundary, a read that cannot be
/// served returns `0`, and a read may only come up short at the end of the
/// store.
pub trait BackingStore: Send + Sync {
    /// Copy the bytes at `file_offset` into `out`.
    ///
    /// Returns the number of bytes copied.
    fn read(&self, file_offset: u64, out: &mut [u8]) -> usize;

    /// The total length of the store in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the store contains no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether concurrent [BackingStore::read] calls are safe without
    /// external serialisation.
    ///
    /// When this returns `false` the cache routes every page fill through a
    /// single guard lock so the store only ever observes one read at a time.
    fn is_thread_safe(&self) -> bool {
        true
    }
}

/// A [BackingStore] over a memory-mapped read-only file.
///
/// This is the preferred store for dump files, reads are plain memory
/// copies out of the mapped view.
pub struct MmapStore {
    map: memmap2::Mmap,
}

impl MmapStore {
    /// Open the file at `path` and map it into memory.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Map an already opened file into memory.
    pub fn from_file(file: &File) -> io::Result<Self> {
        // Safety: the map is read-only and the cache contract declares the
        // underlying file immutable for the lifetime of the store.
        let map = unsafe { memmap2::Mmap::map(file)? };

        #[cfg(unix)]
        map.advise(memmap2::Advice::Random)?;

        Ok(Self { map })
    }
}

impl BackingStore for MmapStore {
    fn read(&self, file_offset: u64, out: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(file_offset) else {
            return 0;
        };
        if start >= self.map.len() {
            return 0;
        }

        let n = cmp::min(out.len(), self.map.len() - start);
        out[..n].copy_from_slice(&self.map[start..start + n]);
        n
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

/// A [BackingStore] over any seekable reader.
///
/// The handle is stateful, so reads are linearised behind an internal lock
/// and the store declares itself not thread safe.
pub struct StreamStore<R> {
    reader: Mutex<R>,
    len: u64,
}

impl StreamStore<File> {
    /// Open the file at `path` as a streamed store.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek + Send> StreamStore<R> {
    /// Create a new [StreamStore] from the given reader.
    ///
    /// The reader's length is captured once at construction.
    pub fn new(mut reader: R) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader: Mutex::new(reader),
            len,
        })
    }
}

impl<R: Read + Seek + Send> BackingStore for StreamStore<R> {
    fn read(&self, file_offset: u64, out: &mut [u8]) -> usize {
        if file_offset >= self.len {
            return 0;
        }

        let mut reader = self.reader.lock();
        if reader.seek(SeekFrom::Start(file_offset)).is_err() {
            return 0;
        }

        let mut filled = 0;
        while filled < out.len() {
            match reader.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        filled
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn is_thread_safe(&self) -> bool {
        false
    }
}

/// A [BackingStore] over bytes already resident in memory.
///
/// Useful for live-process snapshot buffers and tests.
pub struct MemStore {
    data: Vec<u8>,
}

impl MemStore {
    /// Create a new [MemStore] over the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for MemStore {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl BackingStore for MemStore {
    fn read(&self, file_offset: u64, out: &mut [u8]) -> usize {
        let Ok(start) = usize::try_from(file_offset) else {
            return 0;
        };
        if start >= self.data.len() {
            return 0;
        }

        let n = cmp::min(out.len(), self.data.len() - start);
        out[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
