use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudop_api::{Object, ObjectStore, RedbStore, manifest};
use cloudop_controller::clients::ClientDeps;
use cloudop_controller::clients::secret::SECRET_KIND;
use cloudop_controller::{
    ApplyMode, BackoffArgs, BatchApplier, BatchConfig, BatchSummary, Error, ProviderArgs,
    Registry, Shutdown,
};

#[derive(Parser)]
#[command(name = "cloudop")]
#[command(about = "Apply or delete a manifest of cloud resources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update every object in the manifest and wait until they converge
    Ensure(ApplyArgs),

    /// Delete every object in the manifest and wait until they are gone
    Delete(ApplyArgs),
}

#[derive(Args)]
struct ApplyArgs {
    /// Manifest file, or - for standard input
    #[arg(short, long)]
    file: String,

    /// Print the decoded objects before applying and log verbosely
    #[arg(short, long)]
    debug: bool,

    /// Objects applied in parallel
    #[arg(short, long, default_value = "5")]
    workers: usize,

    /// Local store for secrets read and written while applying
    #[arg(long, default_value = "cloudop.redb")]
    store: PathBuf,

    #[command(flatten)]
    backoff: BackoffArgs,

    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "RESULT")]
    result: String,
}

async fn read_manifest(file: &str) -> anyhow::Result<String> {
    let mut input = String::new();
    if file == "-" {
        tokio::io::stdin()
            .read_to_string(&mut input)
            .await
            .context("reading standard input")?;
    } else {
        input = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file))?;
    }
    Ok(input)
}

/// Objects the registry has no client for but that other objects read, such
/// as password secrets, are written to the local store first.
async fn seed_store(store: &dyn ObjectStore, objects: &[Object]) -> anyhow::Result<()> {
    for object in objects.iter().filter(|o| o.kind == SECRET_KIND) {
        store
            .apply(object.clone())
            .await
            .with_context(|| format!("storing {}", object.object_ref()))?;
    }
    Ok(())
}

/// One row per object: applied, then skipped, then failed.
fn result_rows(summary: &BatchSummary, failures: &[(cloudop_api::ObjectRef, Error)]) -> Vec<ResultRow> {
    let applied = summary.applied.iter().map(|r| (r, "ok".to_string()));
    let skipped = summary.skipped.iter().map(|r| (r, "skipped".to_string()));
    let failed = failures.iter().map(|(r, e)| (r, format!("failed: {}", e)));

    applied
        .chain(skipped)
        .chain(failed)
        .map(|(r, result)| ResultRow {
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            result,
        })
        .collect()
}

fn print_summary(summary: &BatchSummary, failures: &[(cloudop_api::ObjectRef, Error)]) {
    let rows = result_rows(summary, failures);
    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }
}

async fn run(mode: ApplyMode, args: ApplyArgs) -> anyhow::Result<()> {
    let input = read_manifest(&args.file).await?;
    let objects = manifest::decode(&input).context("decoding manifest")?;
    if objects.is_empty() {
        bail!("manifest {} contains no objects", args.file);
    }
    if args.debug {
        print!("{}", manifest::encode(&objects)?);
    }

    let store: Arc<dyn ObjectStore> = Arc::new(
        RedbStore::open(&args.store).with_context(|| format!("opening {}", args.store.display()))?,
    );
    if mode == ApplyMode::Ensure {
        seed_store(store.as_ref(), &objects).await?;
    }

    let deps = ClientDeps::new(args.provider.build()?).with_store(store);
    let config = BatchConfig {
        workers: args.workers.max(1),
        backoff: args.backoff.policy()?,
        poll: args.backoff.fixed_poll(),
    };
    let applier = BatchApplier::new(Arc::new(Registry::standard()), deps, config);

    let (shutdown_tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current attempts");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(objects = objects.len(), ?mode, "Applying manifest");
    match applier.apply(objects, mode, &shutdown).await {
        Ok(summary) => {
            print_summary(&summary, &[]);
            Ok(())
        }
        Err(Error::Batch {
            total,
            failures,
            summary,
        }) => {
            print_summary(&summary, &failures);
            let failed = failures.len();
            let first = failures
                .into_iter()
                .next()
                .map(|(r, e)| format!("{}: {}", r, e))
                .unwrap_or_default();
            bail!("{} of {} objects failed; first error: {}", failed, total, first)
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (mode, args) = match cli.command {
        Commands::Ensure(args) => (ApplyMode::Ensure, args),
        Commands::Delete(args) => (ApplyMode::Delete, args),
    };

    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("cloudop_controller={level},cloudop_api={level},warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(mode, args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
