use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use isoboot::error::BootError;
use isoboot::pipeline::{config_sources, ConfigSources};
use isoboot::{
    acquire, cache, config, menu, preflight, BootRequest, Catalog, Distribution, Downloader,
    Executor, LoopMounter, Pipeline, PipelineError, Settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "isoboot",
    version,
    about = "Boot a Linux distribution from an ISO image via kexec"
)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Acquire an image, pick its boot entry and kexec into it
    Boot(BootArgs),
    /// List cached images and downloadable distributions
    List,
    /// Show the boot entries of an image
    Entries(EntriesArgs),
}

#[derive(Args, Debug)]
struct BootArgs {
    /// Distribution name from the catalog
    distro: String,

    /// Use this image instead of the cache or a download
    #[arg(long, value_name = "PATH")]
    iso: Option<PathBuf>,

    /// Do everything except loading and starting the kernel
    #[arg(long)]
    dry_run: bool,

    /// Boot entry label, overriding the catalog's boot_label
    #[arg(long, value_name = "LABEL")]
    entry: Option<String>,

    /// Extra kernel parameter (repeatable)
    #[arg(long = "append", value_name = "PARAM")]
    append: Vec<String>,

    /// Download deadline in seconds
    #[arg(long, value_name = "SECS")]
    deadline: Option<u64>,
}

#[derive(Args, Debug)]
struct EntriesArgs {
    /// Image to inspect
    #[arg(long, value_name = "PATH")]
    iso: PathBuf,

    /// Read the configs this catalog distribution declares
    #[arg(long, value_name = "NAME")]
    distro: Option<String>,

    /// Config file inside the image to parse instead of scanning
    #[arg(long = "boot-config", value_name = "PATH")]
    boot_config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("isoboot: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("isoboot={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let settings = config::load_settings(cli.config.as_deref())?;
    let catalog = Catalog::load(&settings.catalog_path)?;
    tracing::debug!("{} distributions in catalog", catalog.len());

    match cli.command {
        Commands::Boot(args) => boot(&settings, &catalog, args),
        Commands::List => list(&settings, &catalog),
        Commands::Entries(args) => entries(&settings, &catalog, args),
    }
}

fn lookup<'a>(catalog: &'a Catalog, name: &str) -> Result<&'a Distribution> {
    catalog.get(name).with_context(|| {
        format!(
            "unknown distribution '{}' (known: {})",
            name,
            catalog.names().join(", ")
        )
    })
}

fn host_pipeline<'a>(catalog: &'a Catalog, settings: &'a Settings) -> Result<Pipeline<'a>> {
    preflight::check_host_tools()?;
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("not running as root; loop mounts and kexec will likely fail");
    }
    Ok(Pipeline::new(
        catalog,
        settings,
        LoopMounter::host(&settings.mount_fstype),
        Executor::syscall(),
    ))
}

fn boot(settings: &Settings, catalog: &Catalog, args: BootArgs) -> Result<()> {
    let distro = lookup(catalog, &args.distro)?;
    let pipeline = host_pipeline(catalog, settings)?;

    let image = pipeline.acquire(
        distro,
        args.iso.as_deref(),
        &Downloader::new()
            .with_connect_timeout(Duration::from_secs(settings.connect_timeout_secs)),
        args.deadline.map(Duration::from_secs),
    )?;

    let request = BootRequest {
        dry_run: args.dry_run,
        label: args.entry,
        extra_params: args.append,
        device: None,
    };

    match pipeline.run(&image, distro, &request) {
        Ok(never) => match never {},
        Err(PipelineError::Boot(BootError::DryRunRefused {
            kernel,
            initrd,
            parameters,
        })) => {
            println!("kernel:  {}", kernel.display());
            if let Some(initrd) = initrd {
                println!("initrd:  {}", initrd.display());
            }
            println!("cmdline: {parameters}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn list(settings: &Settings, catalog: &Catalog) -> Result<()> {
    let cached = cache::find_cached_images(&settings.cache_dir, catalog);
    let items = menu::main_menu(&cached, catalog);
    if items.is_empty() {
        println!(
            "no cached images in '{}' and no distribution has mirrors",
            settings.cache_dir.display()
        );
        return Ok(());
    }
    for (i, item) in items.iter().enumerate() {
        println!("{:>3}  {}", i + 1, item.label());
    }
    Ok(())
}

fn entries(settings: &Settings, catalog: &Catalog, args: EntriesArgs) -> Result<()> {
    let image = acquire::local(&args.iso)?;
    let distro = args
        .distro
        .as_deref()
        .map(|name| lookup(catalog, name))
        .transpose()?;

    let sources = match (&args.boot_config, distro) {
        (Some(path), _) => ConfigSources::Declared {
            image_config: Some(path.as_path()),
            custom: &[],
        },
        (None, Some(distro)) => config_sources(distro),
        (None, None) => ConfigSources::Scan,
    };

    let pipeline = host_pipeline(catalog, settings)?;
    let found = pipeline.list_entries(&image, &sources)?;

    for (i, (item, entry)) in menu::entry_menu(&found).iter().zip(&found).enumerate() {
        println!("{:>3}  {} [{}]", i + 1, item.label(), entry.label);
        println!("       kernel  {}", entry.kernel_path.display());
        for initrd in &entry.initrd_paths {
            println!("       initrd  {}", initrd.display());
        }
        if !entry.parameters.is_empty() {
            println!("       append  {}", entry.parameters);
        }
    }
    Ok(())
}
