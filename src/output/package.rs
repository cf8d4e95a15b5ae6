//! Scratch-directory output with atomic publish.
//!
//! Everything a job produces lands in a hidden scratch directory first.
//! Only when the job reaches a terminal success state is the scratch tree
//! renamed into place and the ZIP moved next to it. A job that fails or
//! hits its deadline discards the scratch tree and the published location
//! is never touched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;

use crate::core::{ExtractError, ImageFormat};
use crate::output::crop::problem_file_name;
use crate::output::manifest::Manifest;

/// Paths of a successfully published job.
#[derive(Debug, Clone)]
pub struct PublishedJob {
    /// `<out_root>/<job_id>/` with the full output tree.
    pub dir: PathBuf,
    /// `<out_root>/<job_id>.zip` with the same tree archived.
    pub zip: PathBuf,
}

/// Writes one job's output tree into a scratch directory.
pub struct OutputWriter {
    out_root: PathBuf,
    scratch: PathBuf,
    job_id: String,
    format: ImageFormat,
}

impl OutputWriter {
    /// Creates the scratch directory, replacing any leftover from a
    /// previous crashed run of the same job.
    pub fn create(
        out_root: &Path,
        job_id: &str,
        format: ImageFormat,
    ) -> Result<Self, ExtractError> {
        let scratch = out_root.join(format!(".{job_id}.tmp"));
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }
        fs::create_dir_all(&scratch)?;
        Ok(Self {
            out_root: out_root.to_path_buf(),
            scratch,
            job_id: job_id.to_string(),
            format,
        })
    }

    /// Writes one problem image; returns its path relative to the job root.
    pub fn write_problem(
        &self,
        page: usize,
        column: usize,
        number: u32,
        image: &RgbImage,
    ) -> Result<String, ExtractError> {
        let dir = self.scratch.join(format!("page_{page}")).join("problems");
        fs::create_dir_all(&dir)?;

        let file_name = problem_file_name(page, column, number, self.format.extension());
        image.save(dir.join(&file_name))?;
        Ok(format!("page_{page}/problems/{file_name}"))
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<(), ExtractError> {
        let json = manifest
            .to_json()
            .map_err(|e| ExtractError::internal(format!("manifest serialization: {e}")))?;
        fs::write(self.scratch.join("manifest.json"), json)?;
        fs::write(self.scratch.join("report.txt"), manifest.summary_report())?;
        Ok(())
    }

    /// Archives the scratch tree and renames everything into place.
    pub fn publish(self) -> Result<PublishedJob, ExtractError> {
        let final_dir = self.out_root.join(&self.job_id);
        let final_zip = self.out_root.join(format!("{}.zip", self.job_id));
        let scratch_zip = self.out_root.join(format!(".{}.zip.tmp", self.job_id));

        let result = (|| -> Result<(), ExtractError> {
            zip_directory(&self.scratch, &scratch_zip)?;
            if final_dir.exists() {
                fs::remove_dir_all(&final_dir)?;
            }
            fs::rename(&self.scratch, &final_dir)?;
            if final_zip.exists() {
                fs::remove_file(&final_zip)?;
            }
            fs::rename(&scratch_zip, &final_zip)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(
                    target: "output",
                    dir = %final_dir.display(),
                    zip = %final_zip.display(),
                    "job output published"
                );
                Ok(PublishedJob {
                    dir: final_dir,
                    zip: final_zip,
                })
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&self.scratch);
                let _ = fs::remove_file(&scratch_zip);
                Err(e)
            }
        }
    }

    /// Removes the scratch tree without publishing anything.
    pub fn discard(self) {
        if let Err(e) = fs::remove_dir_all(&self.scratch) {
            warn!(
                target: "output",
                scratch = %self.scratch.display(),
                error = %e,
                "failed to remove scratch directory"
            );
        }
    }
}

/// Archives every file under `dir` with paths relative to `dir`.
fn zip_directory(dir: &Path, zip_path: &Path) -> Result<(), ExtractError> {
    let file = fs::File::create(zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries: Vec<_> =
            fs::read_dir(&current)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .strip_prefix(dir)
                .map_err(|e| ExtractError::internal(format!("archive path: {e}")))?
                .to_string_lossy()
                .replace('\\', "/");
            writer.start_file(name, options)?;
            writer.write_all(&fs::read(&path)?)?;
        }
    }

    writer.finish()?;
    Ok(())
}
