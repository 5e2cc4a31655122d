mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use facematch_core::outcome::EXIT_UNHANDLED_ERROR;
use facematch_core::pipeline::panic_message;
use facematch_core::{
    FacenetEmbedder, Outcome, Pipeline, PipelineSettings, PreviewWriter, ScrfdDetector,
};
use std::ffi::OsString;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

const FALLBACK_RESULT: &str =
    r#"{"error":"Unexpected error: result could not be written","code":"UNHANDLED_ERROR"}"#;

/// Exactly two positional paths. Help and version flags are disabled so that
/// every invocation answers with a JSON result.
#[derive(Parser, Debug)]
#[command(name = "match_face", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Photograph containing the face to identify
    #[arg(allow_hyphen_values = true)]
    image_path: PathBuf,
    /// Reference embeddings (JSON records or SQLite `reference_faces` table)
    #[arg(allow_hyphen_values = true)]
    embeddings_path: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
        run(std::env::args_os(), &Config::from_env())
    })) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "match_face panicked");
            Outcome::unhandled(&message, Some(format!("panic: {message}")))
        }
    };

    ExitCode::from(report(&mut std::io::stdout().lock(), &outcome))
}

/// Parse `args` and run the pipeline once. Every parse failure is reported
/// as an `INVALID_ARGUMENTS` result.
fn run<I, T>(args: I, config: &Config) -> Outcome
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            tracing::warn!(kind = ?e.kind(), "invalid arguments");
            return Outcome::invalid_arguments();
        }
    };

    tracing::debug!(
        image = %cli.image_path.display(),
        embeddings = %cli.embeddings_path.display(),
        model_dir = %config.model_dir.display(),
        "starting match"
    );

    let mut pipeline = build_pipeline(config);
    pipeline.run(&cli.image_path, &cli.embeddings_path)
}

fn build_pipeline(config: &Config) -> Pipeline<ScrfdDetector, FacenetEmbedder> {
    Pipeline::new(
        ScrfdDetector::new(config.detector_model_path(), config.detection_confidence),
        FacenetEmbedder::new(config.embedder_model_path()),
        PreviewWriter::new(config.preview_dir.clone(), config.preview_prefix.clone()),
        PipelineSettings {
            dataset_root_marker: config.dataset_root_marker.clone(),
        },
    )
}

/// Emit `outcome` and return the process exit code.
///
/// When the result cannot be written, a fallback `UNHANDLED_ERROR` line is
/// attempted and the exit code is always 3.
fn report(out: &mut impl Write, outcome: &Outcome) -> u8 {
    match emit(out, outcome) {
        Ok(()) => outcome.exit_code(),
        Err(e) => {
            tracing::error!(error = ?e, "failed to emit result");
            let fallback = Outcome::unhandled(format!("{e:#}"), None)
                .to_json()
                .unwrap_or_else(|_| FALLBACK_RESULT.to_string());
            let _ = writeln!(out, "{fallback}").and_then(|()| out.flush());
            EXIT_UNHANDLED_ERROR
        }
    }
}

/// Write the outcome as a single compact JSON line.
fn emit(out: &mut impl Write, outcome: &Outcome) -> Result<()> {
    let json = outcome.to_json().context("failed to serialize result")?;
    writeln!(out, "{json}").context("failed to write result to stdout")?;
    out.flush().context("failed to flush stdout")?;
    Ok(())
}
