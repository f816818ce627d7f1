//! In-memory, flat-namespace file backend
//!
//! One global lock over one `BTreeMap<String, FileEntry>` — "serialized by
//! a global file-system lock" (§5) taken literally, since there is no block
//! device or cache here to justify anything finer-grained.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spinning_top::Spinlock;

use super::FsError;

struct FileEntry {
    data: Vec<u8>,
    /// Count of open handles currently denying writes to this file (the
    /// loader's own open of the executable, per §4.1 step 3).
    deny_write_count: u32,
}

struct MemFs {
    files: BTreeMap<String, FileEntry>,
}

static FS: Spinlock<MemFs> = Spinlock::new(MemFs {
    files: BTreeMap::new(),
});

pub fn init() {}

pub fn create(name: &str, size: usize) -> bool {
    let mut fs = FS.lock();
    if fs.files.contains_key(name) {
        return false;
    }
    fs.files.insert(
        name.to_string(),
        FileEntry {
            data: alloc::vec![0u8; size],
            deny_write_count: 0,
        },
    );
    true
}

pub fn remove(name: &str) -> bool {
    FS.lock().files.remove(name).is_some()
}

pub fn exists(name: &str) -> bool {
    FS.lock().files.contains_key(name)
}

/// A single open file: a name plus a private cursor. Two opens of the same
/// name see the same underlying data but track position independently,
/// matching `struct file` in a real Pintos `file_open`.
pub struct OpenFile {
    name: String,
    position: usize,
    deny_write: bool,
}

pub fn open(name: &str) -> Result<OpenFile, FsError> {
    let fs = FS.lock();
    if !fs.files.contains_key(name) {
        return Err(FsError::NotFound);
    }
    Ok(OpenFile {
        name: name.to_string(),
        position: 0,
        deny_write: false,
    })
}

impl OpenFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> usize {
        FS.lock()
            .files
            .get(&self.name)
            .map(|f| f.data.len())
            .unwrap_or(0)
    }

    pub fn tell(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, pos: usize) {
        self.position = pos;
    }

    /// Entire file contents, ignoring the cursor. The loader uses this to
    /// pull the whole executable into memory once rather than streaming it
    /// through many small `read`s.
    pub fn read_all(&self) -> Vec<u8> {
        FS.lock()
            .files
            .get(&self.name)
            .map(|f| f.data.clone())
            .unwrap_or_default()
    }

    /// Reads from the current position, advancing it. Returns 0 at EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let fs = FS.lock();
        let Some(entry) = fs.files.get(&self.name) else {
            return 0;
        };
        if self.position >= entry.data.len() {
            return 0;
        }
        let n = buf.len().min(entry.data.len() - self.position);
        buf[..n].copy_from_slice(&entry.data[self.position..self.position + n]);
        self.position += n;
        n
    }

    /// Writes at the current position, extending the file as needed.
    /// Returns 0 without error if the file currently has writes denied
    /// (the loader's open-for-exec case), matching `file_write`.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut fs = FS.lock();
        let Some(entry) = fs.files.get_mut(&self.name) else {
            return 0;
        };
        if entry.deny_write_count > 0 {
            return 0;
        }
        let end = self.position + buf.len();
        if end > entry.data.len() {
            entry.data.resize(end, 0);
        }
        entry.data[self.position..end].copy_from_slice(buf);
        self.position = end;
        buf.len()
    }

    /// Marks this file's name as write-denied (§4.1 step 3). Idempotent per
    /// handle: calling twice without an intervening `allow_write` would
    /// double the count, so callers (the loader) call it exactly once.
    pub fn deny_write(&mut self) {
        if self.deny_write {
            return;
        }
        if let Some(entry) = FS.lock().files.get_mut(&self.name) {
            entry.deny_write_count += 1;
            self.deny_write = true;
        }
    }

    /// Undoes `deny_write`. Called when the executable's handle is closed
    /// (`process_exit` step 2).
    pub fn allow_write(&mut self) {
        if !self.deny_write {
            return;
        }
        if let Some(entry) = FS.lock().files.get_mut(&self.name) {
            entry.deny_write_count = entry.deny_write_count.saturating_sub(1);
        }
        self.deny_write = false;
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses a unique file name: `FS` is a process-wide static, so
    // tests sharing a name would race under a parallel test runner.

    #[test]
    fn create_rejects_duplicate_names() {
        assert!(create("dup.txt", 4));
        assert!(!create("dup.txt", 4));
        remove("dup.txt");
    }

    #[test]
    fn open_missing_file_is_not_found() {
        assert!(matches!(open("does-not-exist.txt"), Err(FsError::NotFound)));
    }

    #[test]
    fn read_write_round_trip_advances_cursor() {
        create("rw.txt", 0);
        let mut f = open("rw.txt").unwrap();
        assert_eq!(f.write(b"hello"), 5);
        assert_eq!(f.tell(), 5);

        f.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.read(&mut buf), 0); // EOF

        remove("rw.txt");
    }

    #[test]
    fn deny_write_blocks_writes_until_allowed() {
        create("deny.txt", 0);
        let mut writer = open("deny.txt").unwrap();
        let mut reader = open("deny.txt").unwrap();

        reader.deny_write();
        assert_eq!(writer.write(b"x"), 0);

        reader.allow_write();
        assert_eq!(writer.write(b"x"), 1);

        remove("deny.txt");
    }

    #[test]
    fn remove_unlinks_the_name_but_not_open_handles_data() {
        create("unlink.txt", 0);
        let mut f = open("unlink.txt").unwrap();
        f.write(b"data");
        assert!(remove("unlink.txt"));
        assert!(!exists("unlink.txt"));
        // The name is gone, so further ops against it through a *new* open
        // fail; the already-open handle's own writes simply stop landing
        // anywhere once the entry is dropped.
        assert!(open("unlink.txt").is_err());
    }
}
