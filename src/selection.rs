use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tracing::warn;

use crate::domain::{ArchiveId, Checksum, SelectionEntry};
use crate::error::AtbError;

pub const ARCHIVE_COLUMN: &str = "tar_xz";
pub const URL_COLUMN: &str = "tar_xz_url";
pub const MEMBER_COLUMN: &str = "filename_in_tar_xz";
pub const CHECKSUM_COLUMN: &str = "tar_xz_md5";

pub fn read_selection(path: &Path) -> Result<Vec<SelectionEntry>, AtbError> {
    let file = File::open(path)
        .map_err(|err| AtbError::SelectionRead(format!("{}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .map(|head| head.starts_with(&[0x1F, 0x8B]))
        .map_err(|err| AtbError::SelectionRead(format!("{}: {err}", path.display())))?;
    if is_gzip {
        parse_selection(BufReader::new(MultiGzDecoder::new(reader)))
    } else {
        parse_selection(reader)
    }
}

pub fn parse_selection<R: BufRead>(reader: R) -> Result<Vec<SelectionEntry>, AtbError> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line.map_err(|err| AtbError::SelectionRead(err.to_string()))?,
        None => return Ok(Vec::new()),
    };
    let columns: Vec<&str> = header.trim_end_matches('\r').split('\t').collect();
    let position = |name: &str| columns.iter().position(|column| *column == name);

    let missing: Vec<String> = [ARCHIVE_COLUMN, URL_COLUMN, MEMBER_COLUMN]
        .into_iter()
        .filter(|name| position(name).is_none())
        .map(str::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(AtbError::SelectionColumns(missing));
    }
    let (Some(ix_archive), Some(ix_url), Some(ix_member)) = (
        position(ARCHIVE_COLUMN),
        position(URL_COLUMN),
        position(MEMBER_COLUMN),
    ) else {
        return Err(AtbError::SelectionColumns(vec![ARCHIVE_COLUMN.to_string()]));
    };
    let ix_checksum = position(CHECKSUM_COLUMN);

    let mut entries = Vec::new();
    for (index, line) in lines.enumerate() {
        let line_no = index + 2;
        let line = line.map_err(|err| AtbError::SelectionRead(err.to_string()))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let field = |ix: usize| {
            fields.get(ix).copied().ok_or_else(|| {
                AtbError::SelectionRead(format!(
                    "line {line_no}: expected at least {} columns, found {}",
                    ix + 1,
                    fields.len()
                ))
            })
        };

        let archive_id = field(ix_archive)?
            .parse::<ArchiveId>()
            .map_err(|err| AtbError::SelectionRead(format!("line {line_no}: {err}")))?;
        let source_url = field(ix_url)?.trim().to_string();
        let member_path = field(ix_member)?.trim().to_string();
        if source_url.is_empty() || member_path.is_empty() {
            return Err(AtbError::SelectionRead(format!(
                "line {line_no}: empty url or member path"
            )));
        }

        let checksum = match ix_checksum.and_then(|ix| fields.get(ix)).map(|v| v.trim()) {
            None | Some("") => None,
            Some(value) => match value.parse::<Checksum>() {
                Ok(checksum) => Some(checksum),
                Err(err) => {
                    warn!(line = line_no, error = %err, "ignoring unusable checksum");
                    None
                }
            },
        };

        entries.push(SelectionEntry {
            archive_id,
            source_url,
            member_path,
            checksum,
        });
    }

    Ok(entries)
}
