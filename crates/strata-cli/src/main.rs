mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, EXIT_FAILURE, EXIT_PIPELINE_ERROR, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::install_signal_handler;

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Layered, environment-isolated infrastructure provisioning"
)]
struct Cli {
    /// Path to the Strata store directory.
    #[arg(long, default_value = ".strata", global = true)]
    store: PathBuf,

    /// Path to the pipeline definition.
    #[arg(long, default_value = "strata.toml", global = true)]
    pipeline: PathBuf,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct EnvArg {
    /// Environment (workspace) to operate on.
    #[arg(short, long, default_value = "dev")]
    environment: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    env: EnvArg,
    /// Restrict the run to this layer (repeatable).
    #[arg(long = "layer", value_name = "NAME")]
    layers: Vec<String>,
    /// Skip the confirmation prompt.
    #[arg(long, default_value_t = false)]
    auto_approve: bool,
    /// Only show what would happen.
    #[arg(long, default_value_t = false)]
    plan_only: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize the store, write a starter pipeline and select an environment.
    Init {
        #[command(flatten)]
        env: EnvArg,
        /// Overwrite an existing pipeline file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show what apply would do, without changing anything.
    Plan {
        #[command(flatten)]
        env: EnvArg,
        /// Restrict the plan to this layer (repeatable).
        #[arg(long = "layer", value_name = "NAME")]
        layers: Vec<String>,
    },
    /// Apply layers in ascending order.
    Apply {
        #[command(flatten)]
        run: RunArgs,
        /// Re-run provisioning even when inputs are unchanged.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Destroy layers in descending order.
    Destroy {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show the status of every layer in an environment.
    Status {
        #[command(flatten)]
        env: EnvArg,
    },
    /// Show one layer's state record.
    Inspect {
        #[command(flatten)]
        env: EnvArg,
        /// Layer name.
        layer: String,
    },
    /// Manage environment partitions.
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum WorkspaceCommands {
    /// List known environments.
    List,
    /// Delete an environment partition that has no layer records left.
    Delete {
        /// Environment name.
        name: String,
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        auto_approve: bool,
    },
}

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

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let ctx = Context {
        store: cli.store,
        pipeline: cli.pipeline,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Init { env, force } => commands::init::run(&ctx, &env.environment, force),
        Commands::Plan { env, layers } => commands::run::plan(&ctx, &env.environment, layers),
        Commands::Apply { run, force } => commands::run::apply(
            &ctx,
            &run.env.environment,
            commands::run::Flags {
                layers: run.layers,
                auto_approve: run.auto_approve,
                plan_only: run.plan_only,
                force,
            },
        ),
        Commands::Destroy { run } => commands::run::destroy(
            &ctx,
            &run.env.environment,
            commands::run::Flags {
                layers: run.layers,
                auto_approve: run.auto_approve,
                plan_only: run.plan_only,
                force: false,
            },
        ),
        Commands::Status { env } => commands::status::run(&ctx, &env.environment),
        Commands::Inspect { env, layer } => commands::inspect::run(&ctx, &env.environment, &layer),
        Commands::Workspace { command } => match command {
            WorkspaceCommands::List => commands::workspace::list(&ctx),
            WorkspaceCommands::Delete { name, auto_approve } => {
                commands::workspace::delete(&ctx, &name, auto_approve)
            }
        },
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("pipeline error:") {
                EXIT_PIPELINE_ERROR
            } else if msg.starts_with("store error:")
                || msg.starts_with("store lock:")
                || msg.starts_with("environment '")
            {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
