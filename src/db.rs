//! The pool database: descriptor to backing-file resolution, single-opener
//! exclusion, and the file mappings the fabric writes into.
//!
//! Failures surface as `io::Error` so the session controller can translate
//! raw OS errors into protocol statuses.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use memmap2::MmapMut;
use nix::fcntl::{flock, FlockArg};
use nix::sys::mman::{msync, MsFlags};
use nix::unistd::{sysconf, SysconfVar};
use tracing::{debug, error, info};

use crate::consts::POOL_HDR_SIZE;
use crate::proto::PoolAttr;

/// Maps descriptors to backing files under a single pool set directory.
pub struct Db {
    dir: PathBuf,
    mode: u32,
}

/// An open backing pool. Holds the advisory lock and the mapping; dropping
/// it releases both.
pub struct Pool {
    file: File,
    map: MmapMut,
    size: u64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("size", &self.size).finish()
    }
}

impl Db {
    pub fn new<P: AsRef<Path>>(dir: P, mode: u32) -> anyhow::Result<Db> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(anyhow!("pool set directory {:?} is not a directory", dir));
        }
        Ok(Db { dir, mode })
    }

    /// A descriptor names exactly one regular file directly under the pool
    /// set directory, so anything path-like is rejected up front.
    fn pool_path(&self, desc: &str) -> io::Result<PathBuf> {
        if desc.is_empty() || desc.contains('/') || desc == "." || desc == ".." {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(self.dir.join(desc))
    }

    /// Create a fresh pool sized to hold `usable_size` bytes past the
    /// header, lock it, and stamp `attr` into the header. A half-built file
    /// is unlinked before the error makes it out.
    pub fn create(&self, desc: &str, usable_size: u64, attr: &PoolAttr) -> io::Result<Pool> {
        let path = self.pool_path(desc)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(self.mode)
            .open(&path)?;

        match Self::init_created(file, usable_size, attr) {
            Ok(pool) => {
                info!("created pool '{}' ({} usable bytes)", desc, usable_size);
                Ok(pool)
            }
            Err(err) => {
                if let Err(unlink_err) = fs::remove_file(&path) {
                    error!("removing half-built pool {:?}: {}", path, unlink_err);
                }
                Err(err)
            }
        }
    }

    fn init_created(file: File, usable_size: u64, attr: &PoolAttr) -> io::Result<Pool> {
        lock_pool(&file)?;
        let size = POOL_HDR_SIZE as u64 + usable_size;
        file.set_len(size)?;

        // Safety: the mapping does not outlive the file, which Pool owns.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let mut hdr = &mut map[..POOL_HDR_SIZE];
        attr.write_to(&mut hdr)?;
        map.flush_range(0, POOL_HDR_SIZE)?;

        Ok(Pool { file, map, size })
    }

    /// Open an existing pool, decoding its header into `attr`.
    pub fn open(&self, desc: &str, attr: &mut PoolAttr) -> io::Result<Pool> {
        let path = self.pool_path(desc)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        lock_pool(&file)?;

        let size = file.metadata()?.len();
        if size < POOL_HDR_SIZE as u64 {
            error!("pool {:?} is shorter than its header", path);
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        // Safety: the mapping does not outlive the file, which Pool owns.
        let map = unsafe { MmapMut::map_mut(&file)? };
        *attr = PoolAttr::read_from(&mut &map[..POOL_HDR_SIZE])?;

        info!("opened pool '{}' ({} usable bytes)", desc, size - POOL_HDR_SIZE as u64);
        Ok(Pool { file, map, size })
    }

    /// Release the mapping and the advisory lock.
    pub fn close(&self, pool: Pool) {
        debug!("closing pool ({} bytes)", pool.size);
        drop(pool);
    }

    /// Unlink the backing file. Only valid with no current opener.
    pub fn remove(&self, desc: &str) -> io::Result<()> {
        let path = self.pool_path(desc)?;
        fs::remove_file(&path)?;
        info!("removed pool '{}'", desc);
        Ok(())
    }
}

fn lock_pool(file: &File) -> io::Result<()> {
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(io::Error::from)
}

impl Pool {
    /// Address of the first usable byte, past the header.
    pub fn usable_base(&mut self) -> usize {
        // Safety: POOL_HDR_SIZE is within the mapping, checked on open.
        unsafe { self.map.as_mut_ptr().add(POOL_HDR_SIZE) as usize }
    }

    pub fn usable_size(&self) -> u64 {
        self.size - POOL_HDR_SIZE as u64
    }
}

/// Flush an address range of a live file mapping to stable storage. This is
/// the daemon's persist callback in general-purpose mode. The range is
/// widened to page boundaries as msync requires.
pub fn persist(addr: usize, len: usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let len = addr + len - start;
    // Safety: callers hand in ranges inside the pool mapping, which stays
    // live while the fabric is processing.
    if let Err(err) = unsafe { msync(start as *mut libc::c_void, len, MsFlags::MS_SYNC) } {
        error!("msync of {} bytes at {:#x} failed: {}", len, start, err);
    }
}

fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => 4096,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::PoolAttr;

    fn test_attr() -> PoolAttr {
        PoolAttr {
            signature: *b"TESTPOOL",
            major: 1,
            poolset_uuid: [7; 16],
            uuid: [9; 16],
            ..PoolAttr::default()
        }
    }

    #[test]
    fn create_then_open_round_trips_the_header() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let pool = db.create("p0", 1 << 20, &test_attr()).expect("create to succeed");
        assert_eq!(pool.usable_size(), 1 << 20);
        db.close(pool);

        let mut attr = PoolAttr::default();
        let pool = db.open("p0", &mut attr).expect("open to succeed");
        assert_eq!(attr, test_attr());
        assert_eq!(pool.usable_size(), 1 << 20);
    }

    #[test]
    fn create_on_existing_pool_fails_with_eexist() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let pool = db.create("p0", 4096, &test_attr()).expect("create to succeed");
        db.close(pool);

        let err = db.create("p0", 4096, &test_attr()).expect_err("create to fail");
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn open_missing_pool_fails_with_enoent() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let mut attr = PoolAttr::default();
        let err = db.open("nope", &mut attr).expect_err("open to fail");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn second_opener_fails_with_ewouldblock() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let _pool = db.create("p0", 4096, &test_attr()).expect("create to succeed");

        let mut attr = PoolAttr::default();
        let err = db.open("p0", &mut attr).expect_err("open to fail");
        assert_eq!(err.raw_os_error(), Some(libc::EWOULDBLOCK));
    }

    #[test]
    fn remove_unlinks_the_backing_file() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let pool = db.create("p0", 4096, &test_attr()).expect("create to succeed");
        db.close(pool);
        assert!(dir.path().join("p0").exists());

        db.remove("p0").expect("remove to succeed");
        assert!(!dir.path().join("p0").exists());
    }

    #[test]
    fn pathlike_descriptors_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        for desc in ["", ".", "..", "a/b", "/etc/passwd"] {
            let err = db
                .create(desc, 4096, &test_attr())
                .expect_err("create to fail");
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL), "desc: {:?}", desc);
        }
    }

    #[test]
    fn truncated_pool_fails_to_open() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        fs::write(dir.path().join("short"), b"way too small").expect("write to succeed");
        let mut attr = PoolAttr::default();
        let err = db.open("short", &mut attr).expect_err("open to fail");
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn persist_flushes_a_mapped_range() {
        let dir = tempfile::tempdir().expect("tempdir to create");
        let db = Db::new(dir.path(), 0o666).expect("db to init");

        let mut pool = db.create("p0", 8192, &test_attr()).expect("create to succeed");
        let base = pool.usable_base();
        // no crash and no error log is all we can observe here
        persist(base + 100, 1000);
    }
}
