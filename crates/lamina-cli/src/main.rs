mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use lamina_core::{install_signal_handler, BuildOptions, CoreError};
use lamina_runtime::StorageBackend;
use lamina_schema::{Compression, LayerFormat, LayerOutput};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "lamina",
    version,
    about = "Build OCI images from layered recipes, without root"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Log progress at info level.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Log at debug level (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where build state, output images and build roots live.
#[derive(Debug, Args)]
struct StateDirs {
    /// Build state directory: cache, cached bases, lock file.
    #[arg(long, default_value = ".lamina")]
    stacker_dir: PathBuf,
    /// Output OCI image layout.
    #[arg(long, default_value = "oci")]
    oci_dir: PathBuf,
    /// Directory holding per-layer build roots.
    #[arg(long, default_value = "roots")]
    roots_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Btrfs,
    Overlay,
}

impl BackendArg {
    fn resolve(self) -> Option<StorageBackend> {
        match self {
            Self::Auto => None,
            Self::Btrfs => Some(StorageBackend::Btrfs),
            Self::Overlay => Some(StorageBackend::Overlay),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build every layer of a recipe.
    Build {
        /// Path to the recipe TOML file.
        #[arg(short = 'f', long = "file", default_value = "lamina.toml")]
        recipe: PathBuf,
        #[command(flatten)]
        dirs: StateDirs,
        /// Storage backend for build roots.
        #[arg(long, value_enum, default_value = "auto")]
        backend: BackendArg,
        /// Layer container format: tar or squashfs.
        #[arg(long, default_value = "tar")]
        layer_type: LayerFormat,
        /// Layer compression: gzip, zstd or none.
        #[arg(long, default_value = "gzip")]
        compression: Compression,
        /// Seal squashfs layers with dm-verity.
        #[arg(long, default_value_t = false)]
        verity: bool,
        /// Maximum number of layers built at once.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Keep the build root of a failed layer for inspection.
        #[arg(long, default_value_t = false)]
        keep_on_failure: bool,
        /// Fail instead of waiting when another process builds the same layer.
        #[arg(long, default_value_t = false)]
        no_wait: bool,
        /// Stop the whole build after this many seconds.
        #[arg(long)]
        deadline: Option<u64>,
        /// Seconds between SIGTERM and SIGKILL when stopping a step.
        #[arg(long, default_value_t = 10)]
        grace: u64,
        /// Recipe substitution, KEY=VALUE. May be repeated.
        #[arg(long = "substitute", value_name = "KEY=VALUE")]
        substitutions: Vec<String>,
    },
    /// Remove blobs no tag or cache entry references.
    Gc {
        #[command(flatten)]
        dirs: StateDirs,
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Allocate subordinate uid and gid ranges for a user (run as root).
    UnprivSetup {
        /// User to allocate ranges for.
        #[arg(long)]
        user: String,
        /// The user's uid.
        #[arg(long)]
        uid: u32,
        /// The user's gid.
        #[arg(long)]
        gid: u32,
        #[arg(long, default_value = lamina_runtime::idmap::SUBUID_PATH, hide = true)]
        subuid_file: PathBuf,
        #[arg(long, default_value = lamina_runtime::idmap::SUBGID_PATH, hide = true)]
        subgid_file: PathBuf,
    },
    /// Report missing tools, filesystems and id allocations.
    Check {
        #[command(flatten)]
        dirs: StateDirs,
    },
    /// Show the manifest, config and layers of a built image.
    Inspect {
        /// Tag in the output layout.
        tag: String,
        /// Output OCI image layout.
        #[arg(long, default_value = "oci")]
        oci_dir: PathBuf,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Run one operation inside a user namespace on behalf of a build.
    #[command(hide = true)]
    Internal {
        /// JSON-encoded operation.
        payload: String,
    },
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LAMINA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;

    let result = match cli.command {
        Commands::Build {
            recipe,
            dirs,
            backend,
            layer_type,
            compression,
            verity,
            jobs,
            keep_on_failure,
            no_wait,
            deadline,
            grace,
            substitutions,
        } => {
            install_signal_handler();
            let defaults = BuildOptions::default();
            let options = BuildOptions {
                stacker_dir: dirs.stacker_dir,
                oci_dir: dirs.oci_dir,
                roots_dir: dirs.roots_dir,
                backend: backend.resolve(),
                output: LayerOutput {
                    format: layer_type,
                    compression,
                    verity,
                },
                jobs: jobs.unwrap_or(defaults.jobs),
                keep_on_failure,
                no_wait,
                deadline: deadline.map(Duration::from_secs),
                grace: Duration::from_secs(grace),
                copy_retries: defaults.copy_retries,
            };
            commands::build::run(&recipe, options, &substitutions, json_output)
        }
        Commands::Gc { dirs, dry_run } => {
            commands::gc::run(&dirs.stacker_dir, &dirs.oci_dir, dry_run, json_output)
        }
        Commands::UnprivSetup {
            user,
            uid,
            gid,
            subuid_file,
            subgid_file,
        } => commands::unpriv_setup::run(
            &commands::unpriv_setup::Request {
                user: &user,
                uid,
                gid,
                subuid: &subuid_file,
                subgid: &subgid_file,
            },
            json_output,
        ),
        Commands::Check { dirs } => commands::check::run(&dirs.stacker_dir, &dirs.roots_dir, json_output),
        Commands::Inspect { tag, oci_dir } => commands::inspect::run(&oci_dir, &tag, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::Internal { payload } => {
            lamina_runtime::internal::dispatch(&payload).map(|()| 0).map_err(CoreError::from)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            if e.is_cancellation() {
                eprintln!("error: build cancelled");
            } else {
                eprintln!("error: {e}");
            }
            let code = u8::try_from(e.exit_code()).unwrap_or(EXIT_FAILURE);
            ExitCode::from(code)
        }
    }
}
