use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::checksum::CHUNK_SIZE;
use crate::domain::{Collision, ExtractionOutcome};
use crate::error::AtbError;
use crate::store::{publish, stage_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar(TarCompress),
    Zip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompress {
    None,
    Gzip,
    Xz,
}

pub fn detect_format(header: &[u8]) -> Option<ArchiveFormat> {
    match header {
        [0x50, 0x4B, 0x03, 0x04, ..] => Some(ArchiveFormat::Zip),
        [0x1F, 0x8B, ..] => Some(ArchiveFormat::Tar(TarCompress::Gzip)),
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Some(ArchiveFormat::Tar(TarCompress::Xz)),
        _ if header.len() >= 262 && &header[257..262] == b"ustar" => {
            Some(ArchiveFormat::Tar(TarCompress::None))
        }
        _ => None,
    }
}

fn sniff_format(path: &Path) -> Result<ArchiveFormat, AtbError> {
    let file = File::open(path).map_err(|err| open_error(path, err))?;
    let mut header = Vec::with_capacity(512);
    file.take(512)
        .read_to_end(&mut header)
        .map_err(|err| open_error(path, err))?;
    if let Some(format) = detect_format(&header) {
        return Ok(format);
    }
    // pre-POSIX tarballs carry no magic
    let by_name = path
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(".tar"))
        .unwrap_or(false);
    if by_name && header.len() >= 512 {
        return Ok(ArchiveFormat::Tar(TarCompress::None));
    }
    Err(AtbError::ArchiveOpen {
        path: path.to_path_buf(),
        message: "unrecognized archive format".to_string(),
    })
}

fn open_error(path: &Path, err: impl std::fmt::Display) -> AtbError {
    AtbError::ArchiveOpen {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

type EntryVisitor<'a> =
    dyn FnMut(&str, bool, &mut dyn Read) -> Result<ControlFlow<()>, AtbError> + 'a;

/// Feeds every entry to `visit` in archive order as `(path, is_regular_file, body)`.
/// Stops as soon as `visit` breaks; bodies the visitor does not read are skipped.
pub fn for_each_entry(path: &Path, visit: &mut EntryVisitor<'_>) -> Result<(), AtbError> {
    let format = sniff_format(path)?;
    debug!(archive = %path.display(), ?format, "opening archive");
    let file = File::open(path).map_err(|err| open_error(path, err))?;
    match format {
        ArchiveFormat::Tar(TarCompress::None) => visit_tar(BufReader::new(file), path, visit),
        ArchiveFormat::Tar(TarCompress::Gzip) => {
            visit_tar(MultiGzDecoder::new(BufReader::new(file)), path, visit)
        }
        ArchiveFormat::Tar(TarCompress::Xz) => visit_tar(
            XzDecoder::new_multi_decoder(BufReader::new(file)),
            path,
            visit,
        ),
        ArchiveFormat::Zip => visit_zip(file, path, visit),
    }
}

fn visit_tar<R: Read>(
    reader: R,
    path: &Path,
    visit: &mut EntryVisitor<'_>,
) -> Result<(), AtbError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|err| open_error(path, err))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| open_error(path, err))?;
        let name = entry
            .path()
            .map_err(|err| open_error(path, err))?
            .to_string_lossy()
            .into_owned();
        let regular = entry.header().entry_type().is_file();
        let size = entry.size();
        let mut body = SizedBody {
            inner: &mut entry,
            remaining: size,
        };
        if visit(&name, regular, &mut body)?.is_break() {
            break;
        }
    }
    Ok(())
}

// tar entry readers end quietly when the stream is cut short
struct SizedBody<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for SizedBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry truncated, {} bytes short", self.remaining),
            ));
        }
        self.remaining = self.remaining.saturating_sub(read as u64);
        Ok(read)
    }
}

fn visit_zip(file: File, path: &Path, visit: &mut EntryVisitor<'_>) -> Result<(), AtbError> {
    let mut archive = ZipArchive::new(file).map_err(|err| open_error(path, err))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|err| open_error(path, err))?;
        let name = entry.name().to_string();
        let regular = entry.is_file();
        if visit(&name, regular, &mut entry)?.is_break() {
            break;
        }
    }
    Ok(())
}

pub fn flattened_name(member_path: &str, strip_components: usize) -> Option<String> {
    let parts: Vec<&str> = member_path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    let name = parts
        .get(strip_components..)
        .and_then(|rest| rest.last())
        .or_else(|| parts.last())?;
    if *name == ".." {
        return None;
    }
    Some((*name).to_string())
}

pub fn extract(
    archive_path: &Path,
    wanted: &BTreeSet<String>,
    output_dir: &Path,
    strip_components: usize,
) -> Result<ExtractionOutcome, AtbError> {
    match extract_members(archive_path, wanted, output_dir, strip_components) {
        (outcome, None) => Ok(outcome),
        (_, Some(err)) => Err(err),
    }
}

/// Like [`extract`], but on failure still reports the members written before
/// the archive turned out to be unreadable.
pub fn extract_members(
    archive_path: &Path,
    wanted: &BTreeSet<String>,
    output_dir: &Path,
    strip_components: usize,
) -> (ExtractionOutcome, Option<AtbError>) {
    if let Err(err) = fs::create_dir_all(output_dir) {
        return (
            ExtractionOutcome::all_missing(wanted),
            Some(AtbError::Filesystem(err.to_string())),
        );
    }

    let mut remaining = wanted.clone();
    let mut written: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut failure = None;

    if !remaining.is_empty() {
        let mut visit = |name: &str,
                         regular: bool,
                         body: &mut dyn Read|
         -> Result<ControlFlow<()>, AtbError> {
            if !regular || !remaining.contains(name) {
                return Ok(ControlFlow::Continue(()));
            }
            match flattened_name(name, strip_components) {
                Some(output_name) => {
                    let dest = output_dir.join(&output_name);
                    let bytes = write_member(body, &dest, archive_path, &mut buf)?;
                    debug!(member = name, output = %dest.display(), bytes, "extracted member");
                    written
                        .entry(output_name)
                        .or_default()
                        .push(name.to_string());
                    remaining.remove(name);
                }
                None => {
                    warn!(member = name, "member has no usable file name, leaving it missing");
                }
            }
            if remaining.is_empty() {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        };
        if let Err(err) = for_each_entry(archive_path, &mut visit) {
            failure = Some(err);
        }
    }

    let collisions = written
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(output_name, members)| {
            warn!(
                output = %output_name,
                count = members.len(),
                "several members flattened to one file; the last one was kept"
            );
            Collision {
                output_name,
                members,
            }
        })
        .collect();

    let found = wanted.difference(&remaining).cloned().collect();
    let outcome = ExtractionOutcome {
        found,
        missing: remaining,
        collisions,
    };
    (outcome, failure)
}

fn write_member(
    body: &mut dyn Read,
    dest: &Path,
    archive_path: &Path,
    buf: &mut [u8],
) -> Result<u64, AtbError> {
    let mut staged = stage_file(dest, ".part")?;
    let mut total = 0u64;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        loop {
            let read = match body.read(buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(open_error(archive_path, err)),
            };
            writer
                .write_all(&buf[..read])
                .map_err(|err| AtbError::Filesystem(err.to_string()))?;
            total += read as u64;
        }
        writer
            .flush()
            .map_err(|err| AtbError::Filesystem(err.to_string()))?;
    }
    publish(staged, dest)?;
    Ok(total)
}
