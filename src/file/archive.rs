//! System-V archive parsing. Members alias the parent file's buffer; the
//! long-name string table and symbol-table members are consumed in place.

use crate::error::{Error, Result};
use crate::file::{file_type, File, FileType};

/// The fixed 60-byte member header of a sysV archive.
#[derive(Debug, Clone, Copy)]
pub struct ArHdr {
    pub name: [u8; 16],
    pub date: [u8; 12],
    pub uid: [u8; 6],
    pub gid: [u8; 6],
    pub mode: [u8; 8],
    pub size: [u8; 10],
    pub fmag: [u8; 2],
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedArchive {
        reason: reason.into(),
    }
}

/// Parse the decimal ASCII field used by several archive header members.
fn parse_decimal(field: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(field).map_err(|_| malformed("non-ASCII header field"))?;
    text.trim()
        .parse()
        .map_err(|_| malformed(format!("bad numeric header field {text:?}")))
}

impl ArHdr {
    pub const SIZE: usize = 60;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(malformed("truncated member header"));
        }
        let field = |range: std::ops::Range<usize>, out: &mut [u8]| {
            out.copy_from_slice(&data[range]);
        };
        let mut hdr = ArHdr {
            name: [0; 16],
            date: [0; 12],
            uid: [0; 6],
            gid: [0; 6],
            mode: [0; 8],
            size: [0; 10],
            fmag: [0; 2],
        };
        field(0..16, &mut hdr.name);
        field(16..28, &mut hdr.date);
        field(28..34, &mut hdr.uid);
        field(34..40, &mut hdr.gid);
        field(40..48, &mut hdr.mode);
        field(48..58, &mut hdr.size);
        field(58..60, &mut hdr.fmag);
        Ok(hdr)
    }

    fn starts_with(&self, s: &str) -> bool {
        self.name.starts_with(s.as_bytes())
    }

    /// The `// ` member holding long file names.
    pub fn is_strtab(&self) -> bool {
        self.starts_with("// ")
    }

    /// The `/ ` and `/SYM64/ ` symbol-table members.
    pub fn is_symtab(&self) -> bool {
        self.starts_with("/ ") || self.starts_with("/SYM64/ ")
    }

    pub fn size(&self) -> Result<usize> {
        parse_decimal(&self.size)
    }

    /// Decode the member name. Returns the name and the number of body bytes
    /// it consumed (nonzero only for the BSD inline form).
    pub fn read_name(&self, strtab: &[u8], body: &[u8]) -> Result<(String, usize)> {
        // BSD-style long filename: `#1/<len>` with the name leading the body
        if self.starts_with("#1/") {
            let len = parse_decimal(&self.name[3..])?;
            if body.len() < len {
                return Err(malformed("inline member name is out of range"));
            }
            let mut name = &body[..len];
            if let Some(end) = name.iter().position(|&b| b == 0) {
                name = &name[..end];
            }
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| malformed("non-UTF-8 member name"))?;
            return Ok((name, len));
        }

        // SysV-style long filename: `/<offset>` into the name table
        if self.starts_with("/") {
            let start = parse_decimal(&self.name[1..])?;
            if start >= strtab.len() {
                return Err(malformed("member name offset is out of range"));
            }
            let rest = &strtab[start..];
            let len = rest
                .windows(2)
                .position(|w| w == b"/\n")
                .ok_or_else(|| malformed("unterminated long member name"))?;
            let name = String::from_utf8(rest[..len].to_vec())
                .map_err(|_| malformed("non-UTF-8 member name"))?;
            return Ok((name, 0));
        }

        // Short filename, terminated by `/`
        let name = match self.name.iter().position(|&b| b == b'/') {
            Some(end) => &self.name[..end],
            None => &self.name[..],
        };
        let name =
            String::from_utf8(name.to_vec()).map_err(|_| malformed("non-UTF-8 member name"))?;
        Ok((name, 0))
    }
}

/// Enumerate the object members of a sysV archive. Thin archives are
/// recognized by the caller's file-type check and rejected here.
pub fn read_archive_members(file: &File) -> Result<Vec<File>> {
    match file_type(file.contents()) {
        FileType::Archive => {}
        FileType::ThinArchive => {
            return Err(Error::UnsupportedFile {
                path: file.name.clone(),
                what: "thin archives are not supported",
            })
        }
        _ => {
            return Err(Error::Internal {
                what: "read_archive_members on a non-archive",
            })
        }
    }

    let contents = file.contents();
    let mut strtab: &[u8] = &[];
    let mut files = Vec::new();

    // Members start right after the `!<arch>\n` magic, each padded to an
    // even offset.
    let mut data = 8;
    while contents.len() - data >= 2 {
        if data % 2 == 1 {
            data += 1;
        }

        let hdr = ArHdr::parse(&contents[data..])?;
        let body = data + ArHdr::SIZE;
        let size = hdr.size()?;
        if body + size > contents.len() {
            return Err(malformed("member size is out of range"));
        }
        data = body + size;

        if hdr.is_strtab() {
            strtab = &contents[body..data];
            continue;
        }
        if hdr.is_symtab() {
            continue;
        }

        let (name, consumed) = hdr.read_name(strtab, &contents[body..data])?;
        if name == "__.SYMDEF" || name == "__.SYMDEF SORTED" {
            continue;
        }

        files.push(file.member(name, body + consumed..data));
    }

    Ok(files)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod test {
    use super::*;

    fn push_member(archive: &mut Vec<u8>, name_field: &str, body: &[u8]) {
        if archive.len() % 2 == 1 {
            archive.push(b'\n');
        }
        let mut hdr = Vec::new();
        hdr.extend_from_slice(format!("{name_field:<16}").as_bytes());
        hdr.extend_from_slice(format!("{:<12}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<6}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<6}", 0).as_bytes());
        hdr.extend_from_slice(format!("{:<8}", 644).as_bytes());
        hdr.extend_from_slice(format!("{:<10}", body.len()).as_bytes());
        hdr.extend_from_slice(b"`\n");
        assert_eq!(hdr.len(), ArHdr::SIZE);
        archive.extend_from_slice(&hdr);
        archive.extend_from_slice(body);
    }

    #[test]
    fn test_short_and_long_names() {
        let mut bytes = b"!<arch>\n".to_vec();
        push_member(&mut bytes, "/", b"\0\0\0\0"); // symbol table, skipped
        push_member(&mut bytes, "//", b"averylongmembername.o/\n");
        push_member(&mut bytes, "short.o/", b"AAA");
        push_member(&mut bytes, "/0", b"BBBB");

        let file = File::from_bytes("test.a", bytes);
        let members = read_archive_members(&file).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "short.o");
        assert_eq!(members[0].contents(), b"AAA");
        assert_eq!(members[1].name, "averylongmembername.o");
        assert_eq!(members[1].contents(), b"BBBB");
        assert_eq!(members[1].parent.as_deref(), Some("test.a"));
    }

    #[test]
    fn test_bsd_inline_name() {
        let mut bytes = b"!<arch>\n".to_vec();
        let mut body = b"inline.o\0\0".to_vec();
        body.extend_from_slice(b"CCC");
        push_member(&mut bytes, "#1/10", &body);

        let file = File::from_bytes("test.a", bytes);
        let members = read_archive_members(&file).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "inline.o");
        assert_eq!(members[0].contents(), b"CCC");
    }

    #[test]
    fn test_symdef_members_skipped() {
        let mut bytes = b"!<arch>\n".to_vec();
        push_member(&mut bytes, "__.SYMDEF/", b"ignored");
        push_member(&mut bytes, "real.o/", b"DD");

        let file = File::from_bytes("test.a", bytes);
        let members = read_archive_members(&file).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "real.o");
    }

    #[test]
    fn test_thin_archive_rejected() {
        let file = File::from_bytes("thin.a", b"!<thin>\nwhatever".to_vec());
        assert!(matches!(
            read_archive_members(&file),
            Err(Error::UnsupportedFile { .. })
        ));
    }
}
