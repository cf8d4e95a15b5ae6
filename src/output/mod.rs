//! Output artifacts: cropped problem images, the manifest, and the ZIP.
//!
//! All files are written into a scratch directory and published by atomic
//! rename, so a failed or cancelled job never leaves partial output in the
//! published location.

mod crop;
mod manifest;
mod package;

pub use crop::{crop_problem, problem_file_name};
pub use manifest::{ColumnEntry, ErrorEntry, JobStatus, Manifest, PageEntry, ProblemEntry};
pub use package::{OutputWriter, PublishedJob};
