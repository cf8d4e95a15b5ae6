//! exam-crop CLI
//!
//! Extracts individual exam problems from a test-paper PDF into cropped
//! images plus a ZIP archive.
//!
//! # Usage
//!
//! ```bash
//! exam-crop --pdf paper.pdf --out output/
//! exam-crop --pdf paper.pdf --out output/ --strategy local_only --dpi 300
//! ```
//!
//! Exit codes: 0 full success, 10 partial success, 20 failed, 30 invalid
//! input. Remote OCR credentials come from `REMOTE_OCR_APP_ID` /
//! `REMOTE_OCR_APP_KEY`, overridden by `--remote-credentials-file`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use exam_crop::core::{
    ExtractError, ImageFormat, JobConfig, OcrStrategy, RemoteCredentials,
};
use exam_crop::output::JobStatus;
use exam_crop::pipeline::{Extractor, ProgressSink, ProgressUpdate};

const EXIT_OK: u8 = 0;
const EXIT_PARTIAL: u8 = 10;
const EXIT_FAILED: u8 = 20;
const EXIT_INVALID_INPUT: u8 = 30;

#[derive(Parser)]
#[command(name = "exam-crop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Extract exam problems from a test-paper PDF", long_about = None)]
struct Cli {
    /// Input PDF file
    #[arg(long)]
    pdf: PathBuf,

    /// Output root directory
    #[arg(long)]
    out: PathBuf,

    /// OCR strategy (local_only, local_then_remote, manual_fallback)
    #[arg(long, default_value = "local_then_remote")]
    strategy: String,

    /// Rasterization density
    #[arg(long, default_value_t = 200)]
    dpi: u32,

    /// Retry budget per column for OCR invocations
    #[arg(long = "max-retries", default_value_t = 2)]
    max_retries: u32,

    /// JSON file with remote OCR credentials; overrides the environment
    #[arg(long = "remote-credentials-file")]
    remote_credentials_file: Option<PathBuf>,

    /// Expected number of problems in the document
    #[arg(long = "expected-count")]
    expected_count: Option<u32>,

    /// Per-job deadline in seconds
    #[arg(long = "deadline-secs")]
    deadline_secs: Option<u64>,

    /// Emit JPEG problem images instead of PNG
    #[arg(long)]
    jpeg: bool,

    /// Print progress events
    #[arg(long)]
    progress: bool,
}

fn build_config(cli: &Cli) -> Result<JobConfig, ExtractError> {
    let strategy: OcrStrategy = cli.strategy.parse()?;

    let credentials = match &cli.remote_credentials_file {
        Some(path) => Some(RemoteCredentials::from_file(path)?),
        None => RemoteCredentials::from_env(),
    };

    let config = JobConfig::default()
        .with_strategy(strategy)
        .with_dpi(cli.dpi)
        .with_max_retries(cli.max_retries)
        .with_expected_problem_count(cli.expected_count)
        .with_remote_credentials(credentials)
        .with_deadline(cli.deadline_secs.map(Duration::from_secs))
        .with_image_format(if cli.jpeg {
            ImageFormat::Jpeg
        } else {
            ImageFormat::Png
        });
    config.validate()?;
    Ok(config)
}

fn exit_code_for(error: &ExtractError) -> u8 {
    match error {
        ExtractError::InvalidInput { .. } | ExtractError::Config { .. } => EXIT_INVALID_INPUT,
        _ => EXIT_FAILED,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    exam_crop::utils::init_tracing();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let extractor = match Extractor::new(config) {
        Ok(extractor) => extractor,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let extractor = if cli.progress {
        let sink: ProgressSink = Arc::new(|update: ProgressUpdate| {
            println!("[{:>3}%] {}", update.percent, update.stage);
        });
        extractor.with_progress(sink)
    } else {
        extractor
    };

    info!(pdf = %cli.pdf.display(), out = %cli.out.display(), "starting extraction");

    match extractor.run(&cli.pdf, &cli.out).await {
        Ok(report) => {
            for error in &report.manifest.errors {
                eprintln!("warning [{}]: {}", error.kind, error.message);
            }
            match report.status {
                JobStatus::Ok => {
                    if let Some(zip) = &report.zip_path {
                        println!("{}", zip.display());
                    }
                    ExitCode::from(EXIT_OK)
                }
                JobStatus::Partial => {
                    if let Some(zip) = &report.zip_path {
                        println!("{}", zip.display());
                    }
                    ExitCode::from(EXIT_PARTIAL)
                }
                JobStatus::Failed => ExitCode::from(EXIT_FAILED),
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
