use std::sync::Arc;

use super::{FileSystem, InodeRef};
use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::param::NOFILE;

pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREATE: u32 = 0x200;

pub enum FileType {
    Console,
    Inode(InodeRef),
}

/// An open file. Shared between descriptor tables and mappings through
/// `Arc`: cloning is `filedup`, dropping the last reference is `fileclose`.
pub struct File {
    pub file_type: FileType,
    pub readable: bool,
    pub writable: bool,
}

impl File {
    pub fn new_console() -> Arc<Self> {
        Arc::new(File {
            file_type: FileType::Console,
            readable: true,
            writable: true,
        })
    }

    pub fn new_inode(inode: InodeRef, readable: bool, writable: bool) -> Arc<Self> {
        Arc::new(File {
            file_type: FileType::Inode(inode),
            readable,
            writable,
        })
    }

    /// The backing inode, if this file has one.
    pub fn inode(&self) -> Option<&InodeRef> {
        match &self.file_type {
            FileType::Inode(ip) => Some(ip),
            FileType::Console => None,
        }
    }
}

/// Descriptor table with stdin, stdout and stderr on the console.
pub(crate) fn default_fd_table() -> Vec<Option<Arc<File>>> {
    let mut table = vec![None; NOFILE];
    table[0] = Some(File::new_console());
    table[1] = Some(File::new_console());
    table[2] = Some(File::new_console());
    table
}

impl Kernel {
    /// Install `file` in the lowest free descriptor of the current process.
    pub fn fd_alloc(&self, file: Arc<File>) -> KResult<usize> {
        let data = unsafe { self.current().data_mut() };
        let fd = data.ofile.iter().position(Option::is_none).ok_or(KernelError::BadFileDescriptor)?;
        data.ofile[fd] = Some(file);
        Ok(fd)
    }

    /// The file open at `fd` in the current process.
    pub fn fd_get(&self, fd: usize) -> KResult<Arc<File>> {
        let data = unsafe { self.current().data_mut() };
        data.ofile.get(fd).cloned().flatten().ok_or(KernelError::BadFileDescriptor)
    }

    pub fn close(&self, fd: usize) -> KResult<()> {
        let data = unsafe { self.current().data_mut() };
        match data.ofile.get_mut(fd).and_then(Option::take) {
            Some(_) => Ok(()),
            None => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Open (or with `O_CREATE`, create) `path` on the root file system.
    pub fn open(&self, path: &str, omode: u32) -> KResult<usize> {
        let fs = self.fs();
        fs.begin_op();
        let inode = if omode & O_CREATE != 0 {
            fs.lookup(path).or_else(|_| fs.create(path))
        } else {
            fs.lookup(path)
        };
        fs.end_op();

        let readable = omode & O_WRONLY == 0;
        let writable = omode & (O_WRONLY | O_RDWR) != 0;
        self.fd_alloc(File::new_inode(inode?, readable, writable))
    }
}
