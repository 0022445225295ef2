use std::path::Path;

use crate::transfer::FileEntry;

/// The file selected for streaming. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Position of the file in the transfer's metadata.
    pub index: usize,
    pub path: String,
    pub length: u64,
    /// Byte offset of the file within the transfer's piece space.
    pub offset: u64,
}

impl FileDescriptor {
    pub fn from_entry(index: usize, entry: &FileEntry) -> Self {
        Self {
            index,
            path: entry.path.clone(),
            length: entry.length,
            offset: entry.offset,
        }
    }

    /// Absolute end offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn display_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }

    /// Lowercased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.path)
    }

    pub fn content_type(&self) -> &'static str {
        match self.extension().as_deref() {
            Some("mkv") => "video/x-matroska",
            Some("avi") => "video/x-msvideo",
            Some("webm") => "video/webm",
            _ => "video/mp4",
        }
    }
}

pub(crate) fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}
