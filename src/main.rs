use anyhow::Context;
use clap::{Parser, Subcommand};
use foldersync_lib::config::AppConfig;
use foldersync_lib::core::{SyncEngine, SyncRequest};
use foldersync_lib::digest::DigestVerifier;
use foldersync_lib::logging::init_logging;
use foldersync_lib::storage::create_storage;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "foldersync")]
#[command(version)]
#[command(about = "Sync a local directory with an object store using content digests")]
struct Cli {
    /// Path to config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging to the console
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download remote changes into a local directory
    Pull {
        /// Local directory
        local: PathBuf,

        /// Only sync this remote sub-folder
        #[arg(long)]
        sub_path: Option<String>,

        /// Delete local entries missing on the remote
        #[arg(long)]
        allow_delete: bool,
    },

    /// Upload local changes to the remote
    Push {
        /// Local directory
        local: PathBuf,

        /// Only sync this remote sub-folder
        #[arg(long)]
        sub_path: Option<String>,

        /// Delete remote entries missing locally
        #[arg(long)]
        allow_delete: bool,
    },

    /// Check whether a local file matches a remote digest
    Verify {
        /// Local file
        file: PathBuf,

        /// Remote digest (md5 hex, optionally with -N part count)
        digest: String,
    },
}

impl Commands {
    fn request(local: &Path, sub_path: Option<&str>, allow_delete: bool) -> SyncRequest {
        let mut request = SyncRequest::new(local);
        if let Some(sub_path) = sub_path {
            request = request.with_sub_path(sub_path);
        }
        if allow_delete {
            request = request.allow_delete();
        }
        request
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(foldersync_lib::logging::get_log_dir);
    init_logging(&config.log, &log_dir, cli.verbose);

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到中断信号，正在取消...");
                cancel.cancel();
            }
        });
    }

    match &cli.command {
        Commands::Verify { file, digest } => {
            let verifier = DigestVerifier::new(config.sync_config().part_sizes)
                .with_read_buffer(config.transfer.read_buffer_size.max(1));
            let verdict = verifier
                .verify(file, digest, &cancel)
                .await
                .with_context(|| format!("校验失败: {:?}", file))?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(if verdict.equal {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Pull {
            local,
            sub_path,
            allow_delete,
        } => {
            let engine = build_engine(&config)?;
            let request = Commands::request(local, sub_path.as_deref(), *allow_delete);
            let report = engine.sync_remote_to_local(&request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(exit_code(report.is_clean()))
        }
        Commands::Push {
            local,
            sub_path,
            allow_delete,
        } => {
            let engine = build_engine(&config)?;
            let request = Commands::request(local, sub_path.as_deref(), *allow_delete);
            let report = engine.sync_local_to_remote(&request, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(exit_code(report.is_clean()))
        }
    }
}

fn build_engine(config: &AppConfig) -> anyhow::Result<SyncEngine> {
    let storage = create_storage(&config.storage, config.transfer.default_upload_part_size)
        .context("创建存储失败")?;
    info!("使用存储: {}", storage.name());
    Ok(SyncEngine::with_config(storage, config.sync_config()))
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
