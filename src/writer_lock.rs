//! Single-writer-process guard for a store directory.
//!
//! The writer holds an exclusive `flock` on `writer.lock` for as long as the
//! store is open and records `pid start_time opened_ns` in it, so another
//! process can tell a live holder from a stale file left by a crash.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::{Error, Result};

pub const WRITER_LOCK_FILE: &str = "writer.lock";

const ACQUIRE_ATTEMPTS: usize = 8;

#[derive(Debug)]
pub struct WriterLock {
    file: File,
}

impl WriterLock {
    pub fn acquire(path: &Path, opened_ns: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        for _ in 0..ACQUIRE_ATTEMPTS {
            if try_lock(&file)? {
                write_lock_record(&file, opened_ns)?;
                return Ok(Self { file });
            }
            if writer_alive(path)? {
                return Err(Error::WriterAlreadyActive);
            }
            std::thread::yield_now();
        }
        Err(Error::WriterAlreadyActive)
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn try_lock(file: &File) -> Result<bool> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn write_lock_record(file: &File, opened_ns: u64) -> Result<()> {
    let (pid, start_time) = lock_identity()?;
    let record = format!("{pid} {start_time} {opened_ns}\n");
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    handle.sync_all()?;
    Ok(())
}

/// Whether the process recorded in the lock file at `path` is still running.
pub fn writer_alive(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let file = OpenOptions::new().read(true).open(path)?;
    lock_owner_alive(&file)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LockRecord {
    pid: u32,
    start_time: u64,
    opened_ns: u64,
}

fn read_lock_record(file: &File) -> Result<LockRecord> {
    let mut contents = String::new();
    let mut clone = file.try_clone()?;
    clone.seek(SeekFrom::Start(0))?;
    clone.read_to_string(&mut contents)?;
    Ok(parse_lock_record(&contents))
}

fn parse_lock_record(contents: &str) -> LockRecord {
    let mut parts = contents.split_whitespace();
    let mut field = || parts.next().and_then(|value| value.parse::<u64>().ok()).unwrap_or(0);
    LockRecord {
        pid: u32::try_from(field()).unwrap_or(0),
        start_time: field(),
        opened_ns: field(),
    }
}

#[cfg(target_os = "linux")]
fn lock_owner_alive(file: &File) -> Result<bool> {
    let record = read_lock_record(file)?;
    if record.pid == 0 {
        return Ok(false);
    }
    let alive = match proc_start_time(record.pid) {
        Ok(start_time) => start_time == record.start_time,
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => return Err(err),
    };
    if !alive {
        log::debug!(
            "writer lock holder pid {} (opened at {}ns) is gone",
            record.pid,
            record.opened_ns
        );
    }
    Ok(alive)
}

#[cfg(target_os = "linux")]
fn lock_identity() -> Result<(u32, u64)> {
    let pid = std::process::id();
    Ok((pid, proc_start_time(pid)?))
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let mut contents = String::new();
    File::open(format!("/proc/{pid}/stat"))?.read_to_string(&mut contents)?;
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    // starttime is field 22; fields after the command name start at 3.
    contents[end + 1..]
        .split_whitespace()
        .nth(19)
        .ok_or(Error::Corrupt("stat missing starttime"))?
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn lock_owner_alive(file: &File) -> Result<bool> {
    Ok(read_lock_record(file)?.pid != 0)
}

#[cfg(not(target_os = "linux"))]
fn lock_identity() -> Result<(u32, u64)> {
    Ok((std::process::id(), 0))
}
