use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How the handler routes a file, decided from the declared MIME type alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Pdf,
    Other,
}

impl FileKind {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.contains("image") {
            FileKind::Image
        } else if mime_type == "application/pdf" {
            FileKind::Pdf
        } else {
            FileKind::Other
        }
    }
}

#[derive(Clone)]
enum Source {
    Memory(Arc<[u8]>),
    Disk(PathBuf),
}

/// A user-selected file. Size and type are known up front; the content is only read
/// when a transform needs it.
#[derive(Clone)]
pub struct InputFile {
    name: String,
    mime_type: String,
    size: u64,
    source: Source,
}

impl InputFile {
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        let bytes = bytes.into();
        InputFile {
            name: name.into(),
            mime_type: mime_type.into(),
            size: bytes.len() as u64,
            source: Source::Memory(bytes),
        }
    }

    /// Picks a file from disk. The declared type comes from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(InputFile {
            name,
            mime_type,
            size: metadata.len(),
            source: Source::Disk(path.to_path_buf()),
        })
    }

    /// Drop target: takes everything from `reader`. Without a declared type the file
    /// is `application/octet-stream`, which the handler ignores.
    pub fn from_reader(mut reader: impl Read, mime_type: Option<&str>) -> io::Result<Self> {
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        Ok(InputFile::from_bytes(
            "stdin",
            mime_type.unwrap_or("application/octet-stream"),
            buffer,
        ))
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mime(&self.mime_type)
    }

    pub fn read(&self) -> io::Result<Arc<[u8]>> {
        match &self.source {
            Source::Memory(bytes) => Ok(Arc::clone(bytes)),
            Source::Disk(path) => Ok(std::fs::read(path)?.into()),
        }
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}
