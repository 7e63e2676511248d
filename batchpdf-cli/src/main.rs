use anyhow::{bail, Context, Result};
use batchpdf::batch::{ProgressBar, DEFAULT_JOB_TIMEOUT};
use batchpdf::intake::{count_pdf_pages, format_file_size, DEFAULT_MAX_FILE_SIZE};
use batchpdf::pages::{parse_partition, parse_selection};
use batchpdf::{
    BatchOptions, BatchProcessor, CommandEngine, FileValidator, OperationKind,
    OperationParameters, SchedulingPolicy, SizeConstraint, UploadedFile,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "batchpdf",
    about = "Run one document operation over many files",
    version,
    author
)]
struct Cli {
    /// Log engine invocations and job transitions
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check files against the intake rules
    Validate {
        /// Files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Use the accepted types of this operation (e.g. "compress")
        #[arg(short, long)]
        operation: Option<OperationKind>,

        /// Maximum file size in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
        max_size: u64,
    },

    /// Resolve a page selection (e.g. "1-3,5,7-9")
    Pages {
        /// Selection expression; "all" or empty selects every page
        expr: String,

        /// Number of pages in the document
        #[arg(short = 'n', long)]
        page_count: u32,
    },

    /// Divide a document into groups of N pages
    Partition {
        /// Number of pages in the document
        page_count: u32,

        /// Pages per group
        group_size: u32,
    },

    /// Run a batch through an external engine
    Run {
        /// Input files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Engine command line, e.g. "python3 engine.py"
        #[arg(short, long, env = "BATCHPDF_ENGINE")]
        engine: String,

        /// Operation parameters as JSON, e.g. '{"operation":"compress","quality":"high"}'
        #[arg(short, long)]
        parameters: String,

        /// Directory for the results
        #[arg(short, long, default_value = "batchpdf-output")]
        output: PathBuf,

        /// Maximum concurrent jobs (defaults to the number of CPUs)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Process files one at a time, in order
        #[arg(long)]
        sequential: bool,

        /// Per-job timeout in seconds
        #[arg(long, default_value_t = DEFAULT_JOB_TIMEOUT.as_secs())]
        timeout: u64,

        /// Maximum file size in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_FILE_SIZE)]
        max_size: u64,

        /// Print statistics as JSON instead of the report
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "batchpdf=debug" } else { "batchpdf=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Validate {
            files,
            operation,
            max_size,
        } => {
            let constraint = SizeConstraint::new(max_size);
            let validator = match operation {
                Some(kind) => FileValidator::for_operation(kind, constraint),
                None => FileValidator::new(constraint),
            };

            let mut invalid = 0;
            for path in &files {
                let file = load_file(path)?;
                match validator.validate(Some(&file)) {
                    Ok(()) => {
                        let pages = file
                            .page_count
                            .map(|n| format!(", {n} pages"))
                            .unwrap_or_default();
                        println!(
                            "✓ {} ({}{pages})",
                            file.name,
                            format_file_size(file.size_bytes)
                        );
                    }
                    Err(e) => {
                        invalid += 1;
                        println!("✗ {}: {e}", file.name);
                    }
                }
            }

            if invalid > 0 {
                eprintln!("{invalid} of {} files rejected", files.len());
                std::process::exit(1);
            }
        }

        Commands::Pages { expr, page_count } => {
            let selection = parse_selection(&expr, page_count).unwrap_or_else(|e| {
                eprintln!("Error parsing page selection '{}': {}", expr, e);
                std::process::exit(1);
            });

            println!("Ranges: {selection}");
            println!("Pages ({}): {:?}", selection.len(), selection.pages());
        }

        Commands::Partition {
            page_count,
            group_size,
        } => {
            let groups = parse_partition(page_count, group_size).unwrap_or_else(|e| {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            });

            for (i, group) in groups.iter().enumerate() {
                println!("Part {}: pages {}", i + 1, group);
            }
        }

        Commands::Run {
            files,
            engine,
            parameters,
            output,
            workers,
            sequential,
            timeout,
            max_size,
            json,
        } => {
            let parameters: OperationParameters =
                serde_json::from_str(&parameters).context("invalid --parameters JSON")?;
            let engine = CommandEngine::from_command_line(&engine, output.clone())
                .context("--engine must name the engine program")?;

            let mut options = BatchOptions::default()
                .with_size_constraint(SizeConstraint::new(max_size))
                .with_job_timeout(Duration::from_secs(timeout));
            if let Some(workers) = workers {
                options = options.with_parallelism(workers);
            }
            let policy = if sequential {
                SchedulingPolicy::Sequential
            } else {
                SchedulingPolicy::Parallel
            };

            let uploads = files
                .iter()
                .map(|path| load_file(path))
                .collect::<Result<Vec<_>>>()?;

            let processor = BatchProcessor::new(engine, options);
            let submission = processor.submit_batch(uploads, parameters, policy)?;
            for rejected in &submission.rejected {
                eprintln!("✗ {}: {}", rejected.file.name, rejected.reason);
            }

            let handle = submission.handle;
            if handle.jobs().is_empty() {
                bail!("no files could be processed");
            }

            let mut progress = handle.subscribe();
            let bar = ProgressBar::new(40);
            let reporter = tokio::spawn(async move {
                loop {
                    let info = progress.borrow_and_update().clone();
                    eprint!("\r{}", bar.render(&info));
                    let _ = std::io::stderr().flush();
                    if info.is_complete() || progress.changed().await.is_err() {
                        break;
                    }
                }
                eprintln!();
            });

            let summary = handle.wait().await;
            let _ = reporter.await;

            let manifest = handle.bundle();
            for entry in &manifest.entries {
                let target = output.join(&entry.archive_name);
                std::fs::rename(entry.output_ref.as_path(), &target).with_context(|| {
                    format!("cannot move result to {}", target.display())
                })?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&summary.statistics)?);
            } else {
                for result in &summary.results {
                    println!("{result}");
                }
                println!();
                println!("{summary}");
                if !manifest.is_empty() {
                    println!("Results written to {}", output.display());
                }
            }

            if !submission.rejected.is_empty() || !summary.all_successful() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Describe a file on disk the way an upload would arrive
fn load_file(path: &Path) -> Result<UploadedFile> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid file name: {}", path.display()))?;
    let size = std::fs::metadata(path)
        .with_context(|| format!("cannot read {}", path.display()))?
        .len();

    let mut file = UploadedFile::new(name, size, path.to_path_buf());
    if file.extension().as_deref() == Some(".pdf") {
        file = file.with_content_type("application/pdf");
    }
    if file.is_pdf() {
        if let Some(pages) = std::fs::read(path).ok().and_then(|bytes| count_pdf_pages(&bytes)) {
            file = file.with_page_count(pages);
        }
    }

    Ok(file)
}
