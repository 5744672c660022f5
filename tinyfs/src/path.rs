//! Component-wise path resolution.
//!
//! Paths split on `/`; an absolute path walks from the root, a relative
//! one from the caller's working directory. Each intermediate component
//! must name a directory that has not been removed. A trailing slash
//! requires the final object to be a directory.

use crate::dir::{self, NAME_MAX};
use crate::inode::Inode;
use crate::FsInner;
use kore::KernelError;
use std::sync::Arc;

/// Copies the next path element out of `path`. Returns the element and
/// the remainder, `None` when no element is left.
fn skip_elem(path: &str) -> Result<Option<(&str, &str)>, KernelError> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Ok(None);
    }
    let end = path.find('/').unwrap_or(path.len());
    let (name, rest) = path.split_at(end);
    if name.len() > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    Ok(Some((name, rest)))
}

fn starting_point(
    fs: &Arc<FsInner>,
    cwd: Option<&Arc<Inode>>,
    path: &str,
) -> Result<Arc<Inode>, KernelError> {
    if path.starts_with('/') {
        FsInner::open_inode(fs, fs.root_sector)
    } else {
        match cwd {
            Some(inode) => Ok(inode.clone()),
            None => FsInner::open_inode(fs, fs.root_sector),
        }
    }
}

fn descend(dir: &Arc<Inode>, name: &str, fs: &Arc<FsInner>) -> Result<Arc<Inode>, KernelError> {
    if !dir.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    if dir.removed() {
        return Err(KernelError::NoSuchEntry);
    }
    let guard = dir.lock.lock();
    let found = dir::lookup(dir, name);
    guard.unlock();
    let (sector, _) = found?.ok_or(KernelError::NoSuchEntry)?;
    FsInner::open_inode(fs, sector)
}

/// Resolves `path` to an inode.
pub(crate) fn resolve(
    fs: &Arc<FsInner>,
    cwd: Option<&Arc<Inode>>,
    path: &str,
) -> Result<Arc<Inode>, KernelError> {
    if path.is_empty() {
        return Err(KernelError::NoSuchEntry);
    }
    let trailing_slash = path.len() > 1 && path.ends_with('/');
    let mut inode = starting_point(fs, cwd, path)?;
    let mut rest = path;
    while let Some((name, r)) = skip_elem(rest)? {
        inode = descend(&inode, name, fs)?;
        rest = r;
    }
    if trailing_slash && !inode.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    Ok(inode)
}

/// Resolves everything up to the last component of `path`, returning the
/// parent directory's inode and the final name. Used by create and
/// remove.
pub(crate) fn resolve_parent(
    fs: &Arc<FsInner>,
    cwd: Option<&Arc<Inode>>,
    path: &str,
) -> Result<(Arc<Inode>, String), KernelError> {
    let mut inode = starting_point(fs, cwd, path)?;
    let Some((mut name, mut rest)) = skip_elem(path)? else {
        // "/" or an empty path has no final component to act on.
        return Err(KernelError::InvalidArgument);
    };
    while let Some((next, r)) = skip_elem(rest)? {
        inode = descend(&inode, name, fs)?;
        name = next;
        rest = r;
    }
    if !inode.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    Ok((inode, name.to_string()))
}
