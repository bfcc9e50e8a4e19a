use std::collections::BTreeSet;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{EntryType, Header};
use xz2::write::XzEncoder;
use zip::write::SimpleFileOptions;

use kira_atb_fetch::error::AtbError;
use kira_atb_fetch::extract::{extract, extract_members, for_each_entry};

fn file_header(size: usize) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size as u64);
    header.set_mode(0o644);
    header.set_entry_type(EntryType::Regular);
    header.set_cksum();
    header
}

fn tar_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, body) in members {
        let mut header = file_header(body.len());
        builder.append_data(&mut header, name, *body).unwrap();
    }
    builder.into_inner().unwrap()
}

fn tar_xz_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(&tar_bytes(members)).unwrap();
    encoder.finish().unwrap()
}

fn tar_gz_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes(members)).unwrap();
    encoder.finish().unwrap()
}

fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.add_directory("batch/", options).unwrap();
    for (name, body) in members {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn wanted(members: &[&str]) -> BTreeSet<String> {
    members.iter().map(|member| member.to_string()).collect()
}

fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

const MEMBERS: &[(&str, &[u8])] = &[
    ("batch/SAMN001.fa", b">SAMN001\nACGT\n"),
    ("batch/SAMN002.fa", b">SAMN002\nGGCC\n"),
    ("batch/SAMN003.fa", b">SAMN003\nTTAA\n"),
];

#[test]
fn extracts_selected_members_from_tar_xz() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar.xz", &tar_xz_bytes(MEMBERS));
    let output = temp.path().join("out");

    let outcome = extract(
        &archive,
        &wanted(&["batch/SAMN001.fa", "batch/SAMN003.fa"]),
        &output,
        1,
    )
    .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.found, wanted(&["batch/SAMN001.fa", "batch/SAMN003.fa"]));
    assert_eq!(fs::read(output.join("SAMN001.fa")).unwrap(), b">SAMN001\nACGT\n");
    assert_eq!(fs::read(output.join("SAMN003.fa")).unwrap(), b">SAMN003\nTTAA\n");
    assert!(!output.join("SAMN002.fa").exists());
    assert!(!output.join("batch").exists());
}

#[test]
fn reports_members_the_archive_lacks() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar.gz", &tar_gz_bytes(MEMBERS));
    let output = temp.path().join("out");

    let outcome = extract(
        &archive,
        &wanted(&["batch/SAMN002.fa", "batch/SAMN999.fa"]),
        &output,
        1,
    )
    .unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.found, wanted(&["batch/SAMN002.fa"]));
    assert_eq!(outcome.missing, wanted(&["batch/SAMN999.fa"]));
    assert!(!output.join("SAMN999.fa").exists());
}

#[test]
fn extracts_from_zip() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.zip", &zip_bytes(MEMBERS));
    let output = temp.path().join("out");

    let outcome = extract(&archive, &wanted(&["batch/SAMN002.fa", "batch/"]), &output, 1).unwrap();

    assert_eq!(outcome.found, wanted(&["batch/SAMN002.fa"]));
    assert_eq!(outcome.missing, wanted(&["batch/"]));
    assert_eq!(fs::read(output.join("SAMN002.fa")).unwrap(), b">SAMN002\nGGCC\n");
}

#[test]
fn plain_tar_is_readable() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar", &tar_bytes(MEMBERS));
    let output = temp.path().join("out");

    let outcome = extract(&archive, &wanted(&["batch/SAMN001.fa"]), &output, 1).unwrap();
    assert!(outcome.is_complete());
}

#[test]
fn flattening_collisions_are_reported() {
    let temp = tempfile::tempdir().unwrap();
    let members: &[(&str, &[u8])] = &[
        ("batch/a/genome.fa", b"first"),
        ("batch/b/genome.fa", b"second"),
    ];
    let archive = write_archive(temp.path(), "batch.tar.xz", &tar_xz_bytes(members));
    let output = temp.path().join("out");

    let outcome = extract(
        &archive,
        &wanted(&["batch/a/genome.fa", "batch/b/genome.fa"]),
        &output,
        1,
    )
    .unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.collisions.len(), 1);
    assert_eq!(outcome.collisions[0].output_name, "genome.fa");
    assert_eq!(
        outcome.collisions[0].members,
        vec!["batch/a/genome.fa".to_string(), "batch/b/genome.fa".to_string()]
    );
    assert_eq!(fs::read(output.join("genome.fa")).unwrap(), b"second");
}

#[test]
fn stops_reading_once_everything_is_found() {
    let temp = tempfile::tempdir().unwrap();
    let large = vec![b'N'; 8192];
    let members: &[(&str, &[u8])] = &[("batch/SAMN001.fa", b">SAMN001\n"), ("batch/big.fa", &large)];
    let mut bytes = tar_bytes(members);
    // cut the archive inside the second member's body
    bytes.truncate(512 * 3 + 100);
    let archive = write_archive(temp.path(), "batch.tar", &bytes);
    let output = temp.path().join("out");

    let outcome = extract(&archive, &wanted(&["batch/SAMN001.fa"]), &output, 1).unwrap();
    assert!(outcome.is_complete());

    let err = extract(&archive, &wanted(&["batch/SAMN404.fa"]), &output, 1).unwrap_err();
    assert_matches!(err, AtbError::ArchiveOpen { .. });
}

#[test]
fn truncated_member_keeps_what_was_already_written() {
    let temp = tempfile::tempdir().unwrap();
    let large = vec![b'N'; 8192];
    let members: &[(&str, &[u8])] = &[("batch/SAMN001.fa", b">SAMN001\n"), ("batch/big.fa", &large)];
    let mut bytes = tar_bytes(members);
    bytes.truncate(512 * 3 + 100);
    let archive = write_archive(temp.path(), "batch.tar", &bytes);
    let output = temp.path().join("out");

    let (outcome, failure) = extract_members(
        &archive,
        &wanted(&["batch/SAMN001.fa", "batch/big.fa"]),
        &output,
        1,
    );

    assert_matches!(failure, Some(AtbError::ArchiveOpen { .. }));
    assert_eq!(outcome.found, wanted(&["batch/SAMN001.fa"]));
    assert_eq!(outcome.missing, wanted(&["batch/big.fa"]));
    assert!(output.join("SAMN001.fa").exists());
    assert!(!output.join("big.fa").exists());
    assert_eq!(fs::read_dir(&output).unwrap().count(), 1);
}

#[test]
fn skips_non_regular_entries() {
    let temp = tempfile::tempdir().unwrap();
    let mut builder = tar::Builder::new(Vec::new());
    let mut dir = Header::new_gnu();
    dir.set_entry_type(EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_cksum();
    builder.append_data(&mut dir, "batch/", std::io::empty()).unwrap();
    let mut link = Header::new_gnu();
    link.set_entry_type(EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    builder
        .append_link(&mut link, "batch/link.fa", "SAMN001.fa")
        .unwrap();
    let mut file = file_header(4);
    builder
        .append_data(&mut file, "batch/SAMN001.fa", &b"ACGT"[..])
        .unwrap();
    let bytes = builder.into_inner().unwrap();
    let archive = write_archive(temp.path(), "batch.tar", &bytes);
    let output = temp.path().join("out");

    let outcome = extract(
        &archive,
        &wanted(&["batch/link.fa", "batch/SAMN001.fa"]),
        &output,
        1,
    )
    .unwrap();

    assert_eq!(outcome.found, wanted(&["batch/SAMN001.fa"]));
    assert_eq!(outcome.missing, wanted(&["batch/link.fa"]));
    assert!(!output.join("link.fa").exists());
}

#[test]
fn empty_selection_does_not_open_the_archive() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar.xz", b"not an archive at all");
    let output = temp.path().join("out");

    let outcome = extract(&archive, &BTreeSet::new(), &output, 1).unwrap();
    assert!(outcome.is_complete());
    assert!(outcome.found.is_empty());
}

#[test]
fn unreadable_archive_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar.xz", b"not an archive at all");

    let err = extract(
        &archive,
        &wanted(&["batch/SAMN001.fa"]),
        &temp.path().join("out"),
        1,
    )
    .unwrap_err();
    assert_matches!(err, AtbError::ArchiveOpen { .. });
}

#[test]
fn visits_entries_in_archive_order() {
    let temp = tempfile::tempdir().unwrap();
    let archive = write_archive(temp.path(), "batch.tar.xz", &tar_xz_bytes(MEMBERS));

    let mut seen = Vec::new();
    for_each_entry(&archive, &mut |name: &str, regular: bool, body: &mut dyn Read| {
        let mut content = String::new();
        body.read_to_string(&mut content).unwrap();
        seen.push((name.to_string(), regular, content.len()));
        if seen.len() == 2 {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })
    .unwrap();

    assert_eq!(
        seen,
        vec![
            ("batch/SAMN001.fa".to_string(), true, 14),
            ("batch/SAMN002.fa".to_string(), true, 14),
        ]
    );
}
