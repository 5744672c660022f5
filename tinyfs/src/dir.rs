//! Directories: fixed 16-byte entries stored in an ordinary inode.
//!
//! An entry packs the child's inode sector, a NUL-terminated name of up to
//! [`NAME_MAX`] bytes, and an in-use flag. Every directory begins with
//! entries for `.` and `..`, which directory listings skip. Callers
//! serialize mutation of one directory through its inode lock.

use crate::inode::Inode;
use kore::KernelError;
use std::sync::Arc;

/// Bytes per directory entry.
pub const ENTRY_SIZE: usize = 16;
/// Longest permitted entry name.
pub const NAME_MAX: usize = 12;

pub(crate) struct DirEntry {
    pub sector: u32,
    pub name: String,
    pub in_use: bool,
}

impl DirEntry {
    fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        let sector = u16::from_le_bytes(raw[0..2].try_into().unwrap()) as u32;
        let name_bytes = &raw[2..2 + NAME_MAX + 1];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        Self {
            sector,
            name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            in_use: raw[15] != 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; ENTRY_SIZE] {
        assert!(self.sector <= u16::MAX as u32, "sector beyond entry range");
        assert!(self.name.len() <= NAME_MAX);
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..2].copy_from_slice(&(self.sector as u16).to_le_bytes());
        raw[2..2 + self.name.len()].copy_from_slice(self.name.as_bytes());
        raw[15] = self.in_use as u8;
        raw
    }
}

/// Reads the entry at byte offset `ofs`, or `None` past the end.
pub(crate) fn read_entry(dir: &Arc<Inode>, ofs: u32) -> Result<Option<DirEntry>, KernelError> {
    let mut raw = [0u8; ENTRY_SIZE];
    if dir.read_at(&mut raw, ofs)? != ENTRY_SIZE {
        return Ok(None);
    }
    Ok(Some(DirEntry::decode(&raw)))
}

fn write_entry(dir: &Arc<Inode>, ofs: u32, entry: &DirEntry) -> Result<(), KernelError> {
    if dir.write_at(&entry.encode(), ofs)? != ENTRY_SIZE {
        return Err(KernelError::NoSpace);
    }
    Ok(())
}

/// Scans `dir` for an in-use entry named `name`; returns its child sector
/// and byte offset.
pub(crate) fn lookup(
    dir: &Arc<Inode>,
    name: &str,
) -> Result<Option<(u32, u32)>, KernelError> {
    let mut ofs = 0;
    while let Some(e) = read_entry(dir, ofs)? {
        if e.in_use && e.name == name {
            return Ok(Some((e.sector, ofs)));
        }
        ofs += ENTRY_SIZE as u32;
    }
    Ok(None)
}

/// Adds an entry for `name` referring to `child_sector`, reusing the first
/// free slot or appending. The caller holds the directory lock.
pub(crate) fn add(dir: &Arc<Inode>, name: &str, child_sector: u32) -> Result<(), KernelError> {
    if name.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    if name.len() > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    if lookup(dir, name)?.is_some() {
        return Err(KernelError::FileExist);
    }
    let mut ofs = 0;
    while let Some(e) = read_entry(dir, ofs)? {
        if !e.in_use {
            break;
        }
        ofs += ENTRY_SIZE as u32;
    }
    write_entry(
        dir,
        ofs,
        &DirEntry {
            sector: child_sector,
            name: name.to_string(),
            in_use: true,
        },
    )
}

/// Clears the in-use flag of `name`'s entry. The caller holds the
/// directory lock.
pub(crate) fn remove(dir: &Arc<Inode>, name: &str) -> Result<(), KernelError> {
    let (sector, ofs) = lookup(dir, name)?.ok_or(KernelError::NoSuchEntry)?;
    write_entry(
        dir,
        ofs,
        &DirEntry {
            sector,
            name: name.to_string(),
            in_use: false,
        },
    )
}

/// Whether `dir` holds no in-use entries besides `.` and `..`.
pub(crate) fn is_empty(dir: &Arc<Inode>) -> Result<bool, KernelError> {
    let mut ofs = 0;
    while let Some(e) = read_entry(dir, ofs)? {
        if e.in_use && e.name != "." && e.name != ".." {
            return Ok(false);
        }
        ofs += ENTRY_SIZE as u32;
    }
    Ok(true)
}
