use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::domain::{Checksum, DigestAlgorithm};

pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Reports whether `path` already holds a file matching `expected`.
///
/// A missing file or a missing checksum is never valid: without a digest to
/// compare against, a local archive cannot be trusted and must be fetched again.
pub fn verify(path: &Path, expected: Option<&Checksum>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    if !path.is_file() {
        return false;
    }
    match file_digest(path, expected.algorithm()) {
        Ok(actual) => expected.matches(&actual),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "checksum read failed");
            false
        }
    }
}

pub fn file_digest(path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    match algorithm {
        DigestAlgorithm::Md5 => {
            let mut ctx = md5::Context::new();
            loop {
                let read = file.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                ctx.consume(&buf[..read]);
            }
            Ok(format!("{:x}", ctx.compute()))
        }
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let read = file.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_known_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"Hello, world!").unwrap();

        let digest = file_digest(&path, DigestAlgorithm::Md5).unwrap();
        assert_eq!(digest, "6cd3556deb0da54bca060b4c39479839");
    }

    #[test]
    fn sha256_of_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let digest = file_digest(&path, DigestAlgorithm::Sha256).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verify_is_case_insensitive() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"Hello, world!").unwrap();

        let expected: Checksum = "6CD3556DEB0DA54BCA060B4C39479839".parse().unwrap();
        assert!(verify(&path, Some(&expected)));
    }

    #[test]
    fn verify_without_checksum_or_file_is_false() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.bin");
        let expected: Checksum = "6cd3556deb0da54bca060b4c39479839".parse().unwrap();
        assert!(!verify(&path, Some(&expected)));

        std::fs::write(&path, b"Hello, world!").unwrap();
        assert!(!verify(&path, None));
    }

    #[test]
    fn verify_rejects_wrong_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"Hello, world?").unwrap();

        let expected: Checksum = "6cd3556deb0da54bca060b4c39479839".parse().unwrap();
        assert!(!verify(&path, Some(&expected)));
    }
}
