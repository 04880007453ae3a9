//! Backing-file I/O. Real direct (`O_DIRECT`)/block I/O is platform-specific
//! and out of scope for this crate (spec Section 1: "the buffer manager's
//! I/O backend is summarised as a contract, not a design") - this engine
//! satisfies that contract with plain positioned reads/writes, same as the
//! template's `io_engine.rs`.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path,
};

use crate::types::{PageId, PAGE_SIZE};

pub struct IoEngine {
    file: File,
}

impl IoEngine {
    pub fn open(path: &Path) -> io::Result<IoEngine> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Ok(IoEngine { file })
    }

    /// Reads the page at `pid` into `buf`. Page 0 is the metadata page,
    /// stored at the start of the file like every other page.
    pub fn read_page(&self, pid: PageId, buf: &mut [u8; PAGE_SIZE]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset_of(pid))
    }

    pub fn write_page(&self, pid: PageId, buf: &[u8; PAGE_SIZE]) -> io::Result<()> {
        self.file.write_at(buf, offset_of(pid))?;
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[inline]
fn offset_of(pid: PageId) -> u64 {
    pid.0 as u64 * PAGE_SIZE as u64
}
