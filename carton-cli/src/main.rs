//! CLI for the carton container runtime.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use carton_oci::{Client, ImageId, Layout, Puller, Store};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "carton",
    version,
    about = "Run commands inside OCI images via overlayfs"
)]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an OCI image and print its identity.
    Pull {
        /// Image reference (e.g., alpine:latest).
        reference: String,
    },

    /// Run a command inside an image, pulling it first if needed.
    Run {
        /// Image reference or 12-character image identity.
        reference: String,

        /// Remove the container directories after the command exits.
        #[arg(long)]
        rm: bool,

        /// Command and arguments; defaults to the image's entrypoint/cmd.
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Import a local image tarball into the store.
    Extract {
        /// Path to the tarball (.tar or .tar.gz).
        tarball: PathBuf,
    },

    /// List locally materialized images.
    Images,

    /// Unmount and remove one or more containers.
    Rm {
        /// Container identifiers.
        #[arg(required = true, num_args = 1..)]
        containers: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("carton: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("carton: failed to set tracing subscriber");
    }
}

fn dispatch(command: Command) -> Result<ExitCode> {
    let layout = Layout::open().context("no usable state directory")?;

    match command {
        Command::Pull { reference } => {
            let mut puller = Puller::new(&layout, Client::new());
            let id = puller.pull(&reference)?;
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            reference,
            rm,
            command,
        } => run(&layout, &reference, &command, rm),
        Command::Extract { tarball } => {
            let store = Store::new(layout.clone());
            let id = store
                .import_tarball(&tarball)
                .with_context(|| format!("importing {}", tarball.display()))?;
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Images => {
            for id in materialized_images(&layout)? {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Rm { containers } => rm_containers(&layout, &containers),
    }
}

/// Resolves a reference to an identity: a materialized identity token is
/// used directly, anything else goes through a pull.
#[cfg(target_os = "linux")]
fn resolve_image(layout: &Layout, reference: &str) -> Result<ImageId> {
    if let Ok(id) = ImageId::parse(reference) {
        if Store::new(layout.clone()).is_materialized(&id) {
            return Ok(id);
        }
    }
    let mut puller = Puller::new(layout, Client::new());
    Ok(puller.pull(reference)?)
}

/// Lists identities with complete image records, sorted.
fn materialized_images(layout: &Layout) -> Result<Vec<ImageId>> {
    let mut ids = Vec::new();
    let images = layout.images_dir();
    if !images.is_dir() {
        return Ok(ids);
    }
    for entry in images.read_dir()? {
        let name = entry?.file_name();
        if let Ok(id) = ImageId::parse(&name.to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(ids)
}

#[cfg(target_os = "linux")]
fn run(layout: &Layout, reference: &str, command: &[String], rm: bool) -> Result<ExitCode> {
    let id = resolve_image(layout, reference)?;
    let runtime = carton::Runtime::new(layout);
    let report = runtime.run(&id, command)?;

    if rm {
        runtime.teardown(&report.container_id)?;
    } else {
        eprintln!(
            "carton: container {id} retained; remove with `carton rm {id}`",
            id = report.container_id
        );
    }

    Ok(report
        .status
        .code()
        .map_or(ExitCode::FAILURE, |code| {
            ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
        }))
}

#[cfg(target_os = "linux")]
fn rm_containers(layout: &Layout, containers: &[String]) -> Result<ExitCode> {
    let runtime = carton::Runtime::new(layout);
    let mut failed = false;
    for container_id in containers {
        if let Err(err) = runtime.teardown(container_id) {
            eprintln!("carton: {container_id}: {err:#}");
            failed = true;
        }
    }
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(not(target_os = "linux"))]
fn run(_: &Layout, _: &str, _: &[String], _: bool) -> Result<ExitCode> {
    anyhow::bail!("container execution requires Linux overlayfs")
}

#[cfg(not(target_os = "linux"))]
fn rm_containers(_: &Layout, _: &[String]) -> Result<ExitCode> {
    anyhow::bail!("container teardown requires Linux overlayfs")
}
