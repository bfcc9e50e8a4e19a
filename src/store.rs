use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::domain::ArchiveId;
use crate::error::AtbError;

pub const ARCHIVES_DIR: &str = "_archives";

#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new(output_root: Utf8PathBuf) -> Self {
        Self { output_root }
    }

    pub fn from_path(output_root: &Path) -> Result<Self, AtbError> {
        let output_root = Utf8PathBuf::from_path_buf(output_root.to_path_buf()).map_err(|path| {
            AtbError::Filesystem(format!("non-utf8 output path: {}", path.display()))
        })?;
        Ok(Self::new(output_root))
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn archives_dir(&self) -> Utf8PathBuf {
        self.output_root.join(ARCHIVES_DIR)
    }

    pub fn archive_path(&self, id: &ArchiveId) -> Utf8PathBuf {
        self.archives_dir().join(id.as_str())
    }

    pub fn ensure_output_root(&self) -> Result<(), AtbError> {
        fs::create_dir_all(self.output_root.as_std_path())
            .map_err(|err| AtbError::Filesystem(err.to_string()))
    }

    pub fn ensure_archives_dir(&self) -> Result<(), AtbError> {
        fs::create_dir_all(self.archives_dir().as_std_path())
            .map_err(|err| AtbError::Filesystem(err.to_string()))
    }

    pub fn remove_archive(&self, id: &ArchiveId) -> io::Result<bool> {
        match fs::remove_file(self.archive_path(id).as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

pub fn stage_file(dest: &Path, suffix: &str) -> Result<NamedTempFile, AtbError> {
    let parent = dest
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| AtbError::Filesystem(err.to_string()))?;
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staged".to_string());
    Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(suffix)
        .tempfile_in(parent)
        .map_err(|err| AtbError::Filesystem(format!("create temp file in {}: {err}", parent.display())))
}

pub fn publish(staged: NamedTempFile, dest: &Path) -> Result<(), AtbError> {
    staged
        .persist(dest)
        .map_err(|err| AtbError::Filesystem(format!("publish {}: {}", dest.display(), err.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("assemblies"));
        let id: ArchiveId = "atb.assembly.r0.2.batch.1.tar.xz".parse().unwrap();

        assert!(store.archives_dir().ends_with("assemblies/_archives"));
        assert!(
            store
                .archive_path(&id)
                .ends_with("_archives/atb.assembly.r0.2.batch.1.tar.xz")
        );
    }

    #[test]
    fn staged_file_is_dropped_unless_published() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("nested").join("archive.tar.xz");

        let staged = stage_file(&dest, ".part").unwrap();
        let staged_path = staged.path().to_path_buf();
        assert!(staged_path.exists());
        assert!(staged_path.to_string_lossy().ends_with(".part"));
        drop(staged);
        assert!(!staged_path.exists());
        assert!(!dest.exists());

        let mut staged = stage_file(&dest, ".part").unwrap();
        staged.write_all(b"payload").unwrap();
        publish(staged, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        let leftovers = std::fs::read_dir(dest.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn remove_missing_archive_is_not_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::from_path(temp.path()).unwrap();
        let id: ArchiveId = "missing.tar.xz".parse().unwrap();
        assert!(!store.remove_archive(&id).unwrap());
    }
}
