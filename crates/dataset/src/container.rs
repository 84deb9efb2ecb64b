//! Packed image archive: one contiguous, memory-mappable array of `u8` images.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "CAPIMGS" | version u32 | captions_per_image u32 | image_count u32
//! | channels u32 | height u32 | width u32 | image_count * channels * height * width bytes
//! ```

use std::{
    fs::File,
    io::{BufWriter, Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use tempfile::NamedTempFile;

use crate::error::{DatasetError, Result};

const ARCHIVE_MAGIC: &[u8; 7] = b"CAPIMGS";
const ARCHIVE_VERSION: u32 = 1;
const HEADER_LEN: usize = ARCHIVE_MAGIC.len() + 6 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u32,
    pub captions_per_image: u32,
    pub image_count: u32,
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl ArchiveHeader {
    pub fn new(captions_per_image: u32, image_count: u32, height: u32, width: u32) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            captions_per_image,
            image_count,
            channels: 3,
            height,
            width,
        }
    }

    /// Bytes occupied by one image. Headers accepted by the reader or writer never overflow.
    pub fn image_len(&self) -> usize {
        self.channels as usize * self.height as usize * self.width as usize
    }

    /// Total archive length, header included, or a format error when the dimensions do not
    /// fit in memory.
    fn checked_len(&self) -> Result<usize> {
        [self.channels, self.height, self.width, self.image_count]
            .into_iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(dim as usize))
            .and_then(|payload| payload.checked_add(HEADER_LEN))
            .ok_or_else(|| {
                DatasetError::Format(format!(
                    "archive of {} images at {}x{}x{} overflows the address space",
                    self.image_count, self.channels, self.height, self.width
                ))
            })
    }

    fn encode(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(ARCHIVE_MAGIC)?;
        for value in [
            self.version,
            self.captions_per_image,
            self.image_count,
            self.channels,
            self.height,
            self.width,
        ] {
            out.write_u32::<LittleEndian>(value)?;
        }
        Ok(())
    }
}

/// Streams images into a temporary file next to the destination and moves it into place
/// once every declared image has been written. Dropping the writer early leaves nothing
/// behind.
pub struct ArchiveWriter {
    path: PathBuf,
    header: ArchiveHeader,
    out: BufWriter<NamedTempFile>,
    written: u32,
}

impl ArchiveWriter {
    pub fn create(path: impl AsRef<Path>, header: ArchiveHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        header.checked_len()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut out = BufWriter::new(NamedTempFile::new_in(dir)?);
        header.encode(&mut out)?;
        Ok(Self {
            path,
            header,
            out,
            written: 0,
        })
    }

    pub fn push(&mut self, image: &[u8]) -> Result<()> {
        if self.written >= self.header.image_count {
            return Err(DatasetError::Format(format!(
                "archive declared {} images, refusing to write more",
                self.header.image_count
            )));
        }
        if image.len() != self.header.image_len() {
            return Err(DatasetError::Format(format!(
                "image has {} bytes, expected {}",
                image.len(),
                self.header.image_len()
            )));
        }
        self.out.write_all(image)?;
        self.written += 1;
        Ok(())
    }

    /// Flush and atomically move the archive to its final path.
    pub fn finish(self) -> Result<PathBuf> {
        if self.written != self.header.image_count {
            return Err(DatasetError::Format(format!(
                "archive declared {} images but {} were written",
                self.header.image_count, self.written
            )));
        }
        let file = self.out.into_inner().map_err(|err| err.into_error())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|err| err.error)?;
        Ok(self.path)
    }
}

/// Read-only, memory-mapped view of an archive. Cloning shares the mapping.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    path: PathBuf,
    data: Arc<Mmap>,
    header: ArchiveHeader,
}

impl ArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // The archive is never written after `ArchiveWriter::finish` renames it into place.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = parse_header(&mmap)?;
        let expected = header.checked_len()?;
        if mmap.len() != expected {
            return Err(DatasetError::Format(format!(
                "{} holds {} bytes, header describes {expected}",
                path.display(),
                mmap.len()
            )));
        }
        Ok(Self {
            path,
            data: Arc::new(mmap),
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.header.image_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.image_count == 0
    }

    /// Zero-copy slice of one channel-first image.
    pub fn image(&self, index: usize) -> Result<&[u8]> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        let stride = self.header.image_len();
        let start = HEADER_LEN + index * stride;
        Ok(&self.data[start..start + stride])
    }
}

fn parse_header(bytes: &[u8]) -> Result<ArchiveHeader> {
    let mut cursor = Cursor::new(bytes);
    let mut magic = [0u8; ARCHIVE_MAGIC.len()];
    cursor.read_exact(&mut magic)?;
    if &magic != ARCHIVE_MAGIC {
        return Err(DatasetError::InvalidMagic { found: magic });
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != ARCHIVE_VERSION {
        return Err(DatasetError::UnsupportedVersion {
            found: version,
            expected: ARCHIVE_VERSION,
        });
    }
    let header = ArchiveHeader {
        version,
        captions_per_image: cursor.read_u32::<LittleEndian>()?,
        image_count: cursor.read_u32::<LittleEndian>()?,
        channels: cursor.read_u32::<LittleEndian>()?,
        height: cursor.read_u32::<LittleEndian>()?,
        width: cursor.read_u32::<LittleEndian>()?,
    };
    if header.channels != 3 {
        return Err(DatasetError::Format(format!(
            "expected 3 channels, found {}",
            header.channels
        )));
    }
    if header.captions_per_image == 0 {
        return Err(DatasetError::Format(
            "captions_per_image must be non-zero".to_string(),
        ));
    }
    header.checked_len()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_and_maps_images() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("TRAIN_IMAGES.bin");
        let mut writer = ArchiveWriter::create(&path, ArchiveHeader::new(5, 2, 2, 2))?;
        writer.push(&[1; 12])?;
        writer.push(&[2; 12])?;
        writer.finish()?;

        let reader = ArchiveReader::open(&path)?;
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.header().captions_per_image, 5);
        assert_eq!(reader.image(1)?, &[2; 12]);
        assert!(matches!(
            reader.image(2),
            Err(DatasetError::IndexOutOfRange { index: 2, len: 2 })
        ));
        Ok(())
    }

    #[test]
    fn abandoned_writer_leaves_no_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("VAL_IMAGES.bin");
        let mut writer = ArchiveWriter::create(&path, ArchiveHeader::new(5, 2, 1, 1))?;
        writer.push(&[0; 3])?;
        drop(writer);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn short_archive_is_rejected_on_finish() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("TEST_IMAGES.bin");
        let mut writer = ArchiveWriter::create(&path, ArchiveHeader::new(5, 2, 1, 1))?;
        writer.push(&[0; 3])?;
        assert!(matches!(writer.finish(), Err(DatasetError::Format(_))));
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn rejects_bad_magic() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, b"NOTANARCHIVE-------------------------")?;
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(DatasetError::InvalidMagic { .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_dimensions_that_overflow() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("huge.bin");
        let mut bytes = Vec::new();
        ArchiveHeader::new(5, 2, u32::MAX, u32::MAX).encode(&mut bytes)?;
        std::fs::write(&path, &bytes)?;
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(DatasetError::Format(_))
        ));

        // An empty archive must still describe images that fit.
        let mut bytes = Vec::new();
        ArchiveHeader::new(5, 0, u32::MAX, u32::MAX).encode(&mut bytes)?;
        std::fs::write(&path, &bytes)?;
        assert!(matches!(
            ArchiveReader::open(&path),
            Err(DatasetError::Format(_))
        ));
        Ok(())
    }
}
