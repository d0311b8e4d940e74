//! Input file handling: memory-mapped byte blobs, file-type sniffing, and
//! library search.

pub mod archive;

use std::fmt::Display;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::context::Options;
use crate::elf::{self, ET_DYN, ET_REL};
use crate::error::{Error, Result};
use crate::util;

/// Backing storage for an input file. Archive members share their parent's
/// mapping; synthesized inputs (tests, the internal object) own a vector.
#[derive(Debug)]
pub enum FileData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl AsRef<[u8]> for FileData {
    fn as_ref(&self) -> &[u8] {
        match self {
            FileData::Mapped(map) => map,
            FileData::Owned(vec) => vec,
        }
    }
}

#[derive(Debug, Clone)]
/// A named byte blob: either a file from disk or a member aliasing into its
/// enclosing archive's buffer.
pub struct File {
    pub name: String,
    data: Arc<FileData>,
    range: Range<usize>,
    /// Name of the enclosing archive, if any.
    pub parent: Option<String>,
}

impl File {
    /// Map `path` into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy().into_owned();
        let io_err = |e: std::io::Error| Error::Io {
            path: name.clone(),
            kind: e.kind(),
        };
        let file = fs::File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len() as usize;
        // An empty file cannot be mapped; it still has a file type.
        let data = if len == 0 {
            FileData::Owned(Vec::new())
        } else {
            FileData::Mapped(unsafe { Mmap::map(&file) }.map_err(io_err)?)
        };
        Ok(Self {
            name,
            range: 0..len,
            data: Arc::new(data),
            parent: None,
        })
    }

    /// Wrap an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            name: name.into(),
            data: Arc::new(FileData::Owned(bytes)),
            range: 0..len,
            parent: None,
        }
    }

    /// A member of this file, aliasing `range` of the same buffer.
    pub fn member(&self, name: String, range: Range<usize>) -> Self {
        Self {
            name,
            data: Arc::clone(&self.data),
            range,
            parent: Some(self.name.clone()),
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data.as_ref().as_ref()[self.range.clone()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What kind of input a byte blob is, judged from its magic.
pub enum FileType {
    Unknown,
    Empty,
    Object,
    Dso,
    Archive,
    ThinArchive,
    Text,
}

/// Sniff the type of `contents`.
pub fn file_type(contents: &[u8]) -> FileType {
    if contents.is_empty() {
        return FileType::Empty;
    }

    if elf::check_magic(contents) {
        if contents.len() < 20 {
            return FileType::Unknown;
        }
        return match util::read_u16(contents, 16) {
            ET_REL => FileType::Object,
            ET_DYN => FileType::Dso,
            _ => FileType::Unknown,
        };
    }

    if contents.starts_with(b"!<arch>\n") {
        return FileType::Archive;
    }
    if contents.starts_with(b"!<thin>\n") {
        return FileType::ThinArchive;
    }

    let is_text = contents.len() >= 4
        && contents[..4]
            .iter()
            .all(|b| b.is_ascii() && !b.is_ascii_control());
    if is_text {
        return FileType::Text;
    }

    FileType::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// The machine an input (or this link) targets.
pub enum MachineType {
    #[default]
    None,
    Riscv32,
    Riscv64,
}

impl Display for MachineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineType::Riscv32 => write!(f, "riscv32"),
            MachineType::Riscv64 => write!(f, "riscv64"),
            MachineType::None => write!(f, "none"),
        }
    }
}

/// Judge the machine type of `contents` from its ELF header, if it has one.
pub fn machine_type(contents: &[u8]) -> MachineType {
    match file_type(contents) {
        FileType::Object | FileType::Dso => {
            if util::read_u16(contents, 18) == elf::EM_RISCV {
                match contents[elf::EI_CLASS] {
                    elf::ELFCLASS32 => MachineType::Riscv32,
                    elf::ELFCLASS64 => MachineType::Riscv64,
                    _ => MachineType::None,
                }
            } else {
                MachineType::None
            }
        }
        _ => MachineType::None,
    }
}

/// Reject inputs whose machine type differs from the requested emulation.
pub fn check_compatibility(opts: &Options, file: &File) -> Result<()> {
    if machine_type(file.contents()) != opts.emulation {
        return Err(Error::IncompatibleFile {
            path: file.name.clone(),
        });
    }
    Ok(())
}

/// Open a candidate library path. Unreadable paths are not an error (the
/// search just moves on); a readable file of a foreign machine type is.
fn open_library(path: &Path) -> Result<Option<File>> {
    let Ok(file) = File::open(path) else {
        return Ok(None);
    };

    match machine_type(file.contents()) {
        MachineType::None | MachineType::Riscv64 => Ok(Some(file)),
        _ => Err(Error::IncompatibleFile { path: file.name }),
    }
}

/// Search the library paths for `lib<name>.a`. First hit wins.
pub fn find_library(opts: &Options, name: &str) -> Result<File> {
    for dir in &opts.library_paths {
        let stem = dir.join(format!("lib{name}.a"));
        if let Some(file) = open_library(&stem)? {
            return Ok(file);
        }
    }

    Err(Error::LibraryNotFound {
        name: name.to_string(),
    })
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_type_sniffing() {
        assert_eq!(file_type(b""), FileType::Empty);
        assert_eq!(file_type(b"!<arch>\nrest"), FileType::Archive);
        assert_eq!(file_type(b"!<thin>\nrest"), FileType::ThinArchive);
        assert_eq!(file_type(b"int main;"), FileType::Text);
        assert_eq!(file_type(&[0xff, 0xfe, 0x00, 0x01]), FileType::Unknown);

        let mut obj = vec![0u8; 64];
        elf::write_magic(&mut obj);
        util::write_u16(&mut obj, 16, ET_REL);
        assert_eq!(file_type(&obj), FileType::Object);
        util::write_u16(&mut obj, 16, ET_DYN);
        assert_eq!(file_type(&obj), FileType::Dso);
    }

    #[test]
    fn test_machine_type() {
        let mut obj = vec![0u8; 64];
        elf::write_magic(&mut obj);
        obj[elf::EI_CLASS] = elf::ELFCLASS64;
        util::write_u16(&mut obj, 16, ET_REL);
        util::write_u16(&mut obj, 18, elf::EM_RISCV);
        assert_eq!(machine_type(&obj), MachineType::Riscv64);

        obj[elf::EI_CLASS] = elf::ELFCLASS32;
        assert_eq!(machine_type(&obj), MachineType::Riscv32);

        util::write_u16(&mut obj, 18, 62); // x86-64
        assert_eq!(machine_type(&obj), MachineType::None);
        assert_eq!(machine_type(b"not elf at all"), MachineType::None);
    }

    #[test]
    fn test_member_aliases_parent() {
        let file = File::from_bytes("parent.a", b"0123456789".to_vec());
        let member = file.member("m.o".to_string(), 2..6);
        assert_eq!(member.contents(), b"2345");
        assert_eq!(member.parent.as_deref(), Some("parent.a"));
    }
}
