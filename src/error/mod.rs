#[derive(thiserror::Error, Debug)]
/// Error type for failures during linking
pub enum Error {
    #[error("An I/O error occurred on {path}: {kind}")]
    Io {
        path: String,
        kind: std::io::ErrorKind,
    },
    #[error("File {path} is too small for an ELF header")]
    FileTooSmall { path: String },
    #[error("File {path} is not an ELF file")]
    NotElf { path: String },
    #[error("Unknown file type: {path}")]
    UnknownFileType { path: String },
    #[error("Incompatible file type: {path}")]
    IncompatibleFile { path: String },
    #[error("Unsupported input {path}: {what}")]
    UnsupportedFile { path: String, what: &'static str },
    #[error("Unknown emulation: {name}")]
    UnknownEmulation { name: String },
    #[error("Library not found: {name}")]
    LibraryNotFound { name: String },
    #[error("No input files")]
    NoInputFiles,
    #[error("Section header is out of range: {offset}")]
    SectionOutOfRange { offset: u64 },
    #[error("String table entry at {offset} is malformed")]
    BadStringTableEntry { offset: u32 },
    #[error("Malformed archive: {reason}")]
    MalformedArchive { reason: String },
    #[error("Invalid relocated section index: {index}")]
    InvalidRelocatedSection { index: u32 },
    #[error("Common local symbol {name}")]
    CommonLocal { name: String },
    #[error("Merge string in {section} is not null terminated")]
    MergeStringNotTerminated { section: String },
    #[error("Size of merge section {section} is not a multiple of its entry size")]
    MergeSizeNotMultiple { section: String },
    #[error("Symbol {name} does not map to a section fragment")]
    BadFragmentSymbol { name: String },
    #[error("Relocation addend does not map to a section fragment")]
    BadFragmentRelocation,
    #[error("Unknown relocation type: {value}")]
    UnknownRelocation { value: u32 },
    #[error("Unsupported relocation type: {value}")]
    UnsupportedRelocation { value: u32 },
    #[error("Undefined symbol: {name}")]
    UndefinedSymbol { name: String },
    #[error("Unknown symbol visibility: {value}")]
    UnknownVisibility { value: u8 },
    #[error("Internal invariant violated: {what}")]
    Internal { what: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
