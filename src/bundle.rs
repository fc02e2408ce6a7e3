use crate::error::Result;
use log::info;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

enum Backing {
    Temporary(NamedTempFile),
    Fixed(File),
}

/// PEM trust anchors collected for the VPN client's `--cafile`.
pub struct TrustBundle {
    backing: Backing,
    path: PathBuf,
}

impl TrustBundle {
    /// Truncates `path`, or creates a temporary file removed on drop.
    pub fn create(path: Option<&Path>) -> Result<TrustBundle> {
        match path {
            Some(path) => Ok(TrustBundle {
                backing: Backing::Fixed(File::create(path)?),
                path: path.to_path_buf(),
            }),
            None => {
                let file = NamedTempFile::new()?;
                let path = file.path().to_path_buf();
                info!(
                    "will collect openconnect_certs in temporary file: {} and verify against them",
                    path.display()
                );
                Ok(TrustBundle {
                    backing: Backing::Temporary(file),
                    path,
                })
            }
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.backing {
            Backing::Temporary(file) => file as &mut dyn Write,
            Backing::Fixed(file) => file as &mut dyn Write,
        }
    }

    pub fn copy_from(&mut self, source: &Path) -> Result<()> {
        let pem = fs::read(source)?;
        self.writer().write_all(&pem)?;
        Ok(())
    }

    pub fn append(&mut self, pem: &str) -> Result<()> {
        let writer = self.writer();
        writer.write_all(pem.as_bytes())?;
        if !pem.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer().flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(fs::metadata(&self.path)?.len() == 0)
    }

    /// Flushes and keeps the file on disk past the end of the run.
    pub fn persist(mut self) -> Result<PathBuf> {
        self.flush()?;
        match self.backing {
            Backing::Temporary(file) => {
                let (_, path) = file.keep().map_err(|e| e.error)?;
                Ok(path)
            }
            Backing::Fixed(_) => Ok(self.path),
        }
    }
}
