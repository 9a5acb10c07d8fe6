/// Workspace tree removal that never follows symlinks or leaves the filesystem.
///
/// Sandboxed code owns its workspace and may plant symlinks to host paths or
/// strip permissions from its own directories. Entries are resolved relative to
/// an open directory descriptor with `AT_SYMLINK_NOFOLLOW`, directories are made
/// owner-accessible before they are descended, and removing a path that is
/// already gone succeeds.
use crate::config::types::{HarnessError, Result};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

struct OwnedDirFd(RawFd);

impl Drop for OwnedDirFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Directory stream; `closedir` also closes the descriptor it was opened from.
struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn os_error(what: &str, name: &CStr) -> HarnessError {
    let err = std::io::Error::last_os_error();
    HarnessError::Workspace(format!("{what} {:?}: {err}", name))
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn stat_at(dir: RawFd, name: &CStr) -> Result<Option<libc::stat>> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe { libc::fstatat(dir, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        if last_errno() == libc::ENOENT {
            return Ok(None);
        }
        return Err(os_error("fstatat", name));
    }
    Ok(Some(unsafe { st.assume_init() }))
}

fn unlink_at(dir: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::unlinkat(dir, name.as_ptr(), flags) };
    if rc != 0 && last_errno() != libc::ENOENT {
        return Err(os_error("unlinkat", name));
    }
    Ok(())
}

/// Names of every entry in `dir`, excluding `.` and `..`.
fn list_entries(dir: RawFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir) };
    if iter_fd < 0 {
        return Err(HarnessError::Workspace(format!(
            "dup for directory listing failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(iter_fd);
        }
        return Err(HarnessError::Workspace(format!("fdopendir failed: {err}")));
    }
    let stream = DirStream(stream);

    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            let errno = last_errno();
            if errno != 0 {
                return Err(HarnessError::Workspace(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            return Ok(names);
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    }
}

fn purge_dir_at(parent: RawFd, name: &CStr, st: &libc::stat, root_dev: libc::dev_t) -> Result<()> {
    if st.st_dev != root_dev {
        return Err(HarnessError::Workspace(format!(
            "refusing to cross a filesystem boundary at {:?}",
            name
        )));
    }
    // A sandbox may have chmod'ed its own directories to 000.
    if st.st_mode & 0o700 != 0o700 {
        unsafe {
            libc::fchmodat(parent, name.as_ptr(), 0o700, 0);
        }
    }

    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        if last_errno() == libc::ENOENT {
            return Ok(());
        }
        return Err(os_error("openat", name));
    }
    let dir = OwnedDirFd(fd);

    for child in list_entries(dir.0)? {
        let Some(child_st) = stat_at(dir.0, &child)? else {
            continue;
        };
        if child_st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            purge_dir_at(dir.0, &child, &child_st, root_dev)?;
        } else {
            unlink_at(dir.0, &child, 0)?;
        }
    }
    drop(dir);
    unlink_at(parent, name, libc::AT_REMOVEDIR)
}

/// Remove `path` and everything below it.
pub fn purge_tree(path: &Path) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        HarnessError::Workspace(format!("cannot purge a path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        HarnessError::Workspace(format!("cannot purge a path without file name: {}", path.display()))
    })?;
    let name = CString::new(name.as_bytes())
        .map_err(|_| HarnessError::Workspace(format!("path contains NUL: {}", path.display())))?;
    let parent_c = CString::new(parent.as_os_str().as_bytes())
        .map_err(|_| HarnessError::Workspace(format!("path contains NUL: {}", parent.display())))?;

    let fd = unsafe { libc::open(parent_c.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        if last_errno() == libc::ENOENT {
            return Ok(());
        }
        return Err(os_error("open", &parent_c));
    }
    let parent_dir = OwnedDirFd(fd);

    match stat_at(parent_dir.0, &name)? {
        None => Ok(()),
        Some(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => {
            purge_dir_at(parent_dir.0, &name, &st, st.st_dev)
        }
        Some(_) => unlink_at(parent_dir.0, &name, 0),
    }
}
