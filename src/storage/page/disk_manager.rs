//! Disk manager for page-level I/O.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{BufcoreError, Result};
use crate::storage::page::{PageId, PageStore, PAGE_SIZE};

/// File-backed [`PageStore`].
///
/// Each volume is a file `vol-<n>.db` inside the managed directory; page `p`
/// lives at byte offset `p * PAGE_SIZE`. Files are opened lazily on first use.
pub struct DiskManager {
    /// Directory holding the volume files.
    dir: PathBuf,
    /// Open volume files.
    files: Mutex<HashMap<u32, File>>,
}

impl DiskManager {
    /// Opens (creating if needed) a directory of volume files.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| BufcoreError::Storage(format!("Failed to create volume directory: {e}")))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the directory holding the volume files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of a volume file.
    #[must_use]
    pub fn volume_path(&self, volume: u32) -> PathBuf {
        self.dir.join(format!("vol-{volume}.db"))
    }

    /// Returns the number of pages a volume file currently covers.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub fn num_pages(&self, volume: u32) -> Result<u32> {
        self.with_file(volume, |file| {
            let len = file
                .metadata()
                .map_err(|e| BufcoreError::Storage(format!("Failed to get file metadata: {e}")))?
                .len();
            Ok(len.div_ceil(PAGE_SIZE as u64) as u32)
        })
    }

    /// Flushes all buffered writes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any sync fails.
    pub fn sync(&self) -> Result<()> {
        for file in self.files.lock().values() {
            file.sync_all()
                .map_err(|e| BufcoreError::Storage(format!("Failed to sync file: {e}")))?;
        }
        Ok(())
    }

    fn with_file<T>(&self, volume: u32, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut files = self.files.lock();
        if !files.contains_key(&volume) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.volume_path(volume))
                .map_err(|e| {
                    BufcoreError::Storage(format!("Failed to open volume {volume}: {e}"))
                })?;
            files.insert(volume, file);
        }
        match files.get_mut(&volume) {
            Some(file) => f(file),
            None => Err(BufcoreError::Storage(format!("Volume {volume} not open"))),
        }
    }
}

impl PageStore for DiskManager {
    /// Reads a page; bytes past the end of the file read as zero.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.with_file(id.volume, |file| {
            file.seek(SeekFrom::Start(id.offset()))
                .map_err(|e| BufcoreError::Storage(format!("Failed to seek to page: {e}")))?;

            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(BufcoreError::Storage(format!(
                            "Failed to read page {id}: {e}"
                        )))
                    }
                }
            }
            buf[filled..].fill(0);
            Ok(())
        })
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        self.with_file(id.volume, |file| {
            file.seek(SeekFrom::Start(id.offset()))
                .map_err(|e| BufcoreError::Storage(format!("Failed to seek to page: {e}")))?;
            file.write_all(buf)
                .map_err(|e| BufcoreError::Storage(format!("Failed to write page {id}: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_dm() -> (DiskManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        (dm, temp_dir)
    }

    #[test]
    fn test_read_write_page() {
        let (dm, _temp) = create_test_dm();
        let id = PageId::main(2);

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 42;
        page[100] = 0xFF;
        dm.write_page(id, &page).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(id, &mut buf).unwrap();
        assert_eq!(buf[0], 42);
        assert_eq!(buf[100], 0xFF);
        assert_eq!(dm.num_pages(0).unwrap(), 3);
    }

    #[test]
    fn test_read_nonexistent_page() {
        let (dm, _temp) = create_test_dm();
        let mut buf = vec![0x55u8; PAGE_SIZE];
        dm.read_page(PageId::main(100), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_volumes_are_separate_files() {
        let (dm, _temp) = create_test_dm();
        let page = vec![7u8; PAGE_SIZE];
        dm.write_page(PageId::new(1, 0), &page).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId::new(2, 0), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert!(dm.volume_path(1).exists());
        assert!(dm.volume_path(2).exists());
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            let mut page = vec![0u8; PAGE_SIZE];
            page[0..4].copy_from_slice(&[1, 2, 3, 4]);
            dm.write_page(PageId::main(0), &page).unwrap();
            dm.sync().unwrap();
        }
        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            assert_eq!(dm.num_pages(0).unwrap(), 1);
            let mut buf = vec![0u8; PAGE_SIZE];
            dm.read_page(PageId::main(0), &mut buf).unwrap();
            assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        }
    }
}
