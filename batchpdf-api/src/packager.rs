//! Zip bundles of batch outputs

use batchpdf::batch::ArchiveManifest;
use batchpdf::{BatchError, FileRef, Packager};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Name of the manifest written into every bundle
pub const MANIFEST_NAME: &str = "manifest.json";

/// Writes one deflate-compressed zip per manifest into `output_dir`
#[derive(Debug, Clone)]
pub struct ZipPackager {
    output_dir: PathBuf,
}

impl ZipPackager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn bundle_path(&self, manifest: &ArchiveManifest) -> PathBuf {
        self.output_dir
            .join(format!("batch-{}.zip", manifest.batch_id))
    }
}

impl Packager for ZipPackager {
    async fn package(&self, manifest: &ArchiveManifest) -> batchpdf::Result<FileRef> {
        let path = self.bundle_path(manifest);
        let manifest = manifest.clone();
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_zip(&target, &manifest))
            .await
            .map_err(|e| BatchError::Packaging(format!("packaging task failed: {e}")))??;

        Ok(FileRef::from(path))
    }
}

fn write_zip(path: &Path, manifest: &ArchiveManifest) -> batchpdf::Result<()> {
    let zip_error = |e: zip::result::ZipError| BatchError::Packaging(e.to_string());

    let mut zip = ZipWriter::new(BufWriter::new(File::create(path)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in &manifest.entries {
        zip.start_file(entry.archive_name.as_str(), options)
            .map_err(zip_error)?;
        let mut source = BufReader::new(File::open(entry.output_ref.as_path())?);
        std::io::copy(&mut source, &mut zip)?;
    }

    zip.start_file(MANIFEST_NAME, options).map_err(zip_error)?;
    zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;

    let mut writer = zip.finish().map_err(zip_error)?;
    writer.flush()?;

    debug!(
        path = %path.display(),
        entries = manifest.entries.len(),
        "Wrote bundle"
    );
    Ok(())
}
