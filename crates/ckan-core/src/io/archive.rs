//! Archive format sniffing and metadata entry extraction.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
    /// Gzip whose payload is not a tar archive.
    Gzip,
    Unknown,
}

fn is_tar(header: &[u8]) -> bool {
    header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
}

fn is_zip(header: &[u8]) -> bool {
    matches!(
        header,
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] | [0x50, 0x4B, 0x07, 0x08, ..]
    )
}

/// Identifies an archive from its leading bytes.
///
/// Gzip payloads are decompressed far enough to look for a tar header.
pub fn sniff(header: &[u8]) -> ArchiveFormat {
    if header.starts_with(&[0x1F, 0x8B]) {
        let mut inner = Vec::with_capacity(512);
        let _ = GzDecoder::new(header)
            .take(512)
            .read_to_end(&mut inner);
        return if is_tar(&inner) {
            ArchiveFormat::TarGz
        } else {
            ArchiveFormat::Gzip
        };
    }
    if is_tar(header) {
        return ArchiveFormat::Tar;
    }
    if is_zip(header) {
        return ArchiveFormat::Zip;
    }
    ArchiveFormat::Unknown
}

/// Sniffs the format of a file on disk.
pub fn detect(path: &Path) -> io::Result<ArchiveFormat> {
    // Gzip headers can be long (file names, extra fields), so read generously.
    let mut header = Vec::with_capacity(4096);
    File::open(path)?.take(4096).read_to_end(&mut header)?;
    let format = sniff(&header);
    debug!(path = %path.display(), ?format, "Detected archive format");
    Ok(format)
}

/// Reads every entry whose name ends in `suffix`.
///
/// Returns `(entry name, raw bytes)` pairs in archive order.
pub fn read_entries_with_suffix(
    path: &Path,
    format: ArchiveFormat,
    suffix: &str,
) -> io::Result<Vec<(String, Vec<u8>)>> {
    let file = BufReader::new(File::open(path)?);
    match format {
        ArchiveFormat::TarGz => read_tar(GzDecoder::new(file), suffix),
        ArchiveFormat::Tar => read_tar(file, suffix),
        ArchiveFormat::Zip => read_zip(file, suffix),
        ArchiveFormat::Gzip | ArchiveFormat::Unknown => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a tar or zip archive", path.display()),
        )),
    }
}

fn read_tar<R: Read>(reader: R, suffix: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        if !name.ends_with(suffix) {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        out.push((name, bytes));
    }
    Ok(out)
}

fn read_zip<R: Read + Seek>(mut reader: R, suffix: &str) -> io::Result<Vec<(String, Vec<u8>)>> {
    reader.seek(SeekFrom::Start(0))?;
    let mut archive = zip::ZipArchive::new(reader).map_err(io::Error::other)?;
    let mut out = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(io::Error::other)?;
        if entry.is_dir() || !entry.name().ends_with(suffix) {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        out.push((name, bytes));
    }
    Ok(out)
}
