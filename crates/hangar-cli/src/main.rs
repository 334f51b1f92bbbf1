use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hangar_core::{ArchiveMode, ArtifactStore, DeleteOutcome, FsArtifactStore, StoreConfig};
use tokio::fs::File;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hangar")]
#[command(about = "Upload, fetch, delete and archive job artifacts")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, env = "HANGAR_CONFIG")]
    config: Option<PathBuf>,

    /// Storage root (overrides the config file)
    #[arg(long, env = "HANGAR_ROOT")]
    root: Option<PathBuf>,

    /// Allow `rm`
    #[arg(long)]
    allow_deletion: bool,

    /// Spool archives to disk before writing them out
    #[arg(long)]
    buffered_archives: bool,

    /// Print listings as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List jobs under the storage root
    Jobs,

    /// List a directory inside a job
    Ls {
        job: String,
        #[arg(default_value = "")]
        path: String,
    },

    /// Write an artifact to stdout or a file
    Get {
        job: String,
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload an artifact from a file, or stdin when FILE is omitted
    Put {
        job: String,
        path: String,
        file: Option<PathBuf>,
    },

    /// Delete an artifact, a directory, or (without PATH) the whole job
    Rm {
        job: String,
        #[arg(default_value = "")]
        path: String,
    },

    /// Write a ZIP of the job to stdout or a file
    Zip {
        job: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Args {
    /// config ファイル → フラグ/環境変数 の順に上書き
    fn store_config(&self) -> Result<StoreConfig> {
        let mut config = match (&self.config, &self.root) {
            (Some(path), _) => StoreConfig::load(path)?,
            (None, Some(root)) => StoreConfig::new(root),
            (None, None) => bail!("no storage root configured (use --root, HANGAR_ROOT or --config)"),
        };
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if self.allow_deletion {
            config.allow_deletion = true;
        }
        if self.buffered_archives {
            config.archive_mode = ArchiveMode::Buffered;
        }
        Ok(config)
    }
}

async fn output_sink(output: Option<&PathBuf>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    Ok(match output {
        Some(path) => Box::new(
            File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // ログは stderr（stdout は artifact の出力に使う）
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let store = FsArtifactStore::open(args.store_config()?).await?;

    match &args.command {
        Command::Jobs => {
            let jobs = store.list_jobs().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in jobs {
                    println!("{job}");
                }
            }
        }

        Command::Ls { job, path } => {
            let entries = store.entries(job, path).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let modified = entry
                        .modified
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!(
                        "{:<9} {:>12} {:<19} {}",
                        entry.kind, entry.size, modified, entry.name
                    );
                }
            }
        }

        Command::Get { job, path, output } => {
            let mut reader = store.read(job, path).await?;
            let mut sink = output_sink(output.as_ref()).await?;
            let copied = io::copy(&mut reader, &mut sink).await?;
            sink.flush().await?;
            info!(job = %job, path = %path, bytes = copied, "fetched");
        }

        Command::Put { job, path, file } => {
            let receipt = match file {
                Some(file) => {
                    let mut body = File::open(file)
                        .await
                        .with_context(|| format!("opening {}", file.display()))?;
                    let len = body.metadata().await?.len();
                    store.write(job, path, &mut body, Some(len)).await?
                }
                None => store.write(job, path, &mut io::stdin(), None).await?,
            };
            println!(
                "Wrote {} bytes to {} (sha256 {})",
                receipt.bytes_written,
                receipt.path.display(),
                receipt.sha256
            );
        }

        Command::Rm { job, path } => match store.delete(job, path).await? {
            DeleteOutcome::Removed => println!("Deleted file(s) at path"),
            DeleteOutcome::Absent => println!("Nothing to delete at path"),
        },

        Command::Zip { job, output } => {
            let mut sink = output_sink(output.as_ref()).await?;
            let summary = store.archive(job, &mut sink).await?;
            sink.shutdown().await?;
            info!(job = %job, entries = summary.entries, bytes = summary.bytes, "zipped");
        }
    }

    Ok(())
}
