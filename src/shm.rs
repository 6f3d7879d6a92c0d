//! Named shared-memory pools.
//!
//! A pool is a `shm_open` region mapped into the server. The creating side
//! sizes the region and unlinks the name again on drop; the other side maps
//! the descriptor it received over the socket.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use memmap2::MmapMut;

use crate::event_loop::set_cloexec;

pub struct ShmPool {
    /// Set for the creating side only; unlinked on drop.
    name: Option<CString>,
    file: File,
    map: MmapMut,
    len: usize,
}

fn shm_name(name: &str) -> io::Result<CString> {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(full).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in shm name"))
}

impl ShmPool {
    /// Create (or re-create) the named region with the given size.
    pub fn create(name: &str, len: usize) -> io::Result<ShmPool> {
        let cname = shm_name(name)?;
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        set_cloexec(fd)?;
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(ShmPool {
            name: Some(cname),
            file,
            map,
            len,
        })
    }

    /// Map a region received as a descriptor; the peer owns the name.
    pub fn import(fd: OwnedFd, len: usize) -> io::Result<ShmPool> {
        let file = File::from(fd);
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shm region smaller than declared",
            ));
        }
        Ok(ShmPool {
            name: None,
            file,
            map,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            unsafe {
                libc::shm_unlink(name.as_ptr());
            }
        }
    }
}

impl std::fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmPool")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_import_read() {
        let mut pool = ShmPool::create("cube-test-pool", 4096).unwrap();
        pool.bytes_mut()[..4].copy_from_slice(b"abcd");

        let dup = pool.fd().try_clone_to_owned().unwrap();
        let imported = ShmPool::import(dup, 4096).unwrap();
        assert_eq!(&imported.bytes()[..4], b"abcd");
    }

    #[test]
    fn import_rejects_short_region() {
        let pool = ShmPool::create("cube-test-short", 1024).unwrap();
        let dup = pool.fd().try_clone_to_owned().unwrap();
        assert!(ShmPool::import(dup, 8192).is_err());
    }
}
