use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use assessor_uploader::batch::{BatchOptions, BatchUploader};
use assessor_uploader::config::{ConfigLoader, ResolvedConfig};
use assessor_uploader::derivative::ManifestParser;
use assessor_uploader::domain::{AmbiguousBinding, BindingChoice, ResolvedBinding};
use assessor_uploader::error::UploadError;
use assessor_uploader::output::{JsonOutput, OutputMode, sink_for};
use assessor_uploader::repository::RepositoryHttpClient;
use assessor_uploader::upload::{
    PrepareOptions, UploadContext, UploadCoordinator, UploadOptions,
};
use assessor_uploader::worker::Worker;

#[derive(Parser)]
#[command(name = "assessor-up")]
#[command(about = "Archive ROI sets, annotations and QC outputs next to the images they reference")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./assessor-up.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log every pipeline phase
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Prepare and upload one file")]
    Upload(UploadArgs),
    #[command(about = "Upload every acceptable file below a directory")]
    Batch(BatchArgs),
    #[command(about = "Resolve a file's references without uploading")]
    Resolve(ResolveArgs),
}

#[derive(Args, Clone)]
struct BindingArgs {
    #[arg(long, requires = "experiment")]
    subject: Option<String>,

    #[arg(long, requires = "subject")]
    experiment: Option<String>,
}

impl BindingArgs {
    fn choice(&self) -> Option<BindingChoice> {
        match (&self.subject, &self.experiment) {
            (Some(subject_id), Some(experiment_id)) => Some(BindingChoice {
                subject_id: subject_id.clone(),
                experiment_id: experiment_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Args)]
struct UploadArgs {
    file: PathBuf,

    #[command(flatten)]
    binding: BindingArgs,

    #[arg(long)]
    label: Option<String>,

    #[arg(long)]
    note: Option<String>,
}

#[derive(Args)]
struct BatchArgs {
    root: PathBuf,

    #[arg(long)]
    prefix: Option<String>,

    #[arg(long)]
    note: Option<String>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ResolveArgs {
    file: PathBuf,

    #[command(flatten)]
    binding: BindingArgs,
}

#[derive(Serialize)]
struct ResolveResult {
    file: String,
    binding: ResolvedBinding,
    candidates: Vec<AmbiguousBinding>,
    ambiguous: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<UploadError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &UploadError) -> u8 {
    match error {
        UploadError::Dependency { .. }
        | UploadError::Ambiguity(_)
        | UploadError::PreconditionFailed(_)
        | UploadError::MissingConfig => 2,
        UploadError::RemoteRejected { .. }
        | UploadError::RepositoryHttp(_)
        | UploadError::RepositoryStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.verbose {
        OutputMode::Verbose
    } else {
        OutputMode::Quiet
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let coordinator = build_coordinator(&config)?;

    match cli.command {
        Commands::Upload(args) => run_upload(args, coordinator, output_mode),
        Commands::Batch(args) => run_batch(args, coordinator, &config, output_mode),
        Commands::Resolve(args) => run_resolve(args, coordinator, output_mode),
    }
}

fn build_coordinator(
    config: &ResolvedConfig,
) -> miette::Result<UploadCoordinator<RepositoryHttpClient>> {
    let repository = RepositoryHttpClient::new(&config.repository)?;
    // Base image decoding is not bundled, so no thumbnails are rendered here.
    Ok(UploadCoordinator::new(
        repository,
        config.project.clone(),
        Box::new(ManifestParser),
    ))
}

fn run_upload(
    args: UploadArgs,
    coordinator: UploadCoordinator<RepositoryHttpClient>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let worker = Worker::spawn("upload", move || {
        let sink = sink_for(output_mode);
        let mut ctx = UploadContext::new();
        let prepare = PrepareOptions {
            choice: args.binding.choice(),
        };
        coordinator.prepare(&mut ctx, &args.file, &prepare, sink)?;
        let options = UploadOptions {
            label: args.label,
            note: args.note,
        };
        coordinator.upload(&mut ctx, &options, sink)
    })?;
    let receipt = worker.wait()??;
    JsonOutput::print_receipt(&receipt).into_diagnostic()?;
    Ok(())
}

fn run_batch(
    args: BatchArgs,
    coordinator: UploadCoordinator<RepositoryHttpClient>,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let options = BatchOptions {
        label_prefix: args.prefix.unwrap_or_else(|| config.label_prefix.clone()),
        note: args.note.or_else(|| config.note.clone()),
        dry_run: args.dry_run,
    };
    let worker = Worker::spawn("batch", move || {
        BatchUploader::new(&coordinator, options).run(&args.root, sink_for(output_mode))
    })?;
    let report = worker.wait()??;
    JsonOutput::print_batch(&report).into_diagnostic()?;
    if !report.failed.is_empty() {
        return Err(miette::Report::msg(format!(
            "{} item(s) failed after preparation",
            report.failed.len()
        )));
    }
    Ok(())
}

fn run_resolve(
    args: ResolveArgs,
    coordinator: UploadCoordinator<RepositoryHttpClient>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let worker = Worker::spawn("resolve", move || {
        let mut ctx = UploadContext::new();
        let prepare = PrepareOptions {
            choice: args.binding.choice(),
        };
        coordinator.prepare(&mut ctx, &args.file, &prepare, sink_for(output_mode))?;
        let item = ctx.prepared().cloned().ok_or_else(|| {
            UploadError::PreconditionFailed("file was not prepared".to_string())
        })?;
        Ok::<_, UploadError>(ResolveResult {
            file: args.file.display().to_string(),
            ambiguous: item.is_ambiguous(),
            binding: item.binding,
            candidates: item.candidates,
        })
    })?;
    let result = worker.wait()??;
    JsonOutput::print_json(&result).into_diagnostic()?;
    Ok(())
}
