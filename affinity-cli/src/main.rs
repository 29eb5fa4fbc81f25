//! Affinity CLI

use affinity_lib::catalog::{Criteria, InstallerCatalog, VersionCriteria};
use affinity_lib::config::validate_version;
use affinity_lib::deps;
use affinity_lib::driver::find_installed_executables;
use affinity_lib::preflight::{Severity, SystemProbe};
use affinity_lib::prefix::{PrepareOutcome, VersionCheck};
use affinity_lib::{
    AffinityError, Config, ConfigLoader, EnvironmentPreparer, HostProfiler, HttpClient,
    InstallRequest, InstallationDriver, PayloadAcquirer, PreflightValidator, Profile, Runtime,
    RuntimeInstaller, SharedRunner, SystemRunner, UninstallRequest,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Environment variable replacing the log filter entirely
const LOG_ENV: &str = "AFFINITY_CLI_LOG";

#[derive(Parser)]
#[command(name = "affinity-cli")]
#[command(about = "Install Affinity on Linux through a dedicated Wine prefix")]
#[command(version)]
struct Cli {
    /// Config file (TOML, YAML or JSON) instead of the one in the config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Wine prefix to provision
    #[arg(long, global = true, env = "AFFINITY_WINE_PREFIX")]
    prefix: Option<PathBuf>,

    /// Directory scanned for installers
    #[arg(long, global = true)]
    installers_path: Option<PathBuf>,

    /// Cache directory for downloads
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline: preflight, runtime, installer, prefix, install, verify
    Install {
        /// Installer to run instead of scanning or downloading
        #[arg(long)]
        installer: Option<PathBuf>,

        /// Download URL for the universal installer
        #[arg(long)]
        download_url: Option<String>,

        /// Installer version to pick from the installers path ("latest" or e.g. 2.6.1)
        #[arg(long)]
        version: Option<String>,

        /// Preparation profile (minimal, standard, full)
        #[arg(long)]
        profile: Option<Profile>,

        /// Pass silent switches to the installer
        #[arg(long)]
        silent: bool,

        /// Log every command instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Download the managed Wine build when no runtime is found
        #[arg(long)]
        fetch_runtime: bool,

        /// Print the install report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List installers found under the installers path
    ListInstallers {
        /// Include unversioned universal installers
        #[arg(long)]
        universal: bool,

        #[arg(long)]
        json: bool,
    },

    /// Check the host without changing anything
    Preflight {
        #[arg(long)]
        json: bool,
    },

    /// Bring the prefix to a preparation profile
    Prepare {
        #[arg(long)]
        profile: Option<Profile>,

        #[arg(long)]
        dry_run: bool,
    },

    /// Refresh an existing prefix, reinstall its components and re-check the install
    Repair {
        #[arg(long)]
        profile: Option<Profile>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Delete the Wine prefix and everything installed in it
    Uninstall {
        /// Also delete the managed Wine builds
        #[arg(long)]
        runtime: bool,

        /// Also delete cached downloads
        #[arg(long)]
        cache: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Download the universal installer into the cache
    Fetch {
        #[arg(long)]
        download_url: Option<String>,

        /// Expected SHA256 of the payload
        #[arg(long)]
        sha256: Option<String>,

        /// Destination file
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Download and unpack the managed Wine build
    Runtime,

    /// Show host, runtime and prefix state
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        if let Some(hint) = e.downcast_ref::<AffinityError>().and_then(|e| e.hint()) {
            eprintln!("Hint: {}", hint);
        }
        process::exit(1);
    }
}

fn init_logging(verbose: u8, json: bool) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,affinity_cli={},affinity_lib={}",
            log_level, log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_target(verbose > 0).init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = ConfigLoader::new(cli.config.clone()).load()?;
    config.verbosity = cli.verbose.min(2);

    if let Some(ref prefix) = cli.prefix {
        config.wine_prefix = prefix.clone();
    }
    if let Some(ref path) = cli.installers_path {
        config.installers_path = path.clone();
    }
    if let Some(ref dir) = cli.cache_dir {
        config.cache_dir = dir.clone();
    }

    debug!("Configuration: {:?}", config);
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Install {
            installer,
            download_url,
            version,
            profile,
            silent,
            dry_run,
            fetch_runtime,
            json,
        } => {
            if let Some(version) = version {
                config.default_version = validate_version(&version)?;
            }
            if let Some(profile) = profile {
                config.profile = profile;
            }
            config.silent = silent;
            config.dry_run = dry_run;
            config.ensure_dirs()?;

            let runner: SharedRunner = SystemRunner::shared(config.dry_run);
            let host = HostProfiler::new().detect();
            info!(
                "Detected {} ({}, {})",
                host.distro_id, host.distro_family, host.package_manager
            );

            let request = InstallRequest {
                installer,
                download_url,
                fetch_runtime,
            };
            let report = InstallationDriver::new(&config, runner, HttpClient::with_defaults()?, host)
                .with_progress(!json)
                .install(&request)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("Installer: {}", report.installer.display());
            println!("Prefix:    {}", report.prefix.display());
            for exe in &report.verified_executables {
                println!("Installed: {}", exe.display());
            }
            if !report.warnings.is_empty() {
                println!("\nWarnings:");
                for warning in &report.warnings {
                    println!("  - {}", warning);
                }
            }
            if report.dry_run {
                println!("\nDry run: nothing was executed.");
            }
        }

        Command::ListInstallers { universal, json } => {
            let catalog = InstallerCatalog::new()?;
            let roots = vec![config.installers_path.clone()];
            let candidates = if universal {
                catalog.scan_universal(&roots)
            } else {
                catalog.scan(&roots)
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
                return Ok(());
            }

            if candidates.is_empty() {
                println!("No installers found under {}", config.installers_path.display());
                return Ok(());
            }

            let preferred = InstallerCatalog::select(
                &candidates,
                &Criteria::version(VersionCriteria::parse(&config.default_version)),
            )
            .ok()
            .map(|c| c.file_path.clone());

            for candidate in &candidates {
                let marker = if Some(&candidate.file_path) == preferred.as_ref() {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {:<40} {:<12} {:>10}  {}",
                    marker,
                    candidate.file_name(),
                    candidate.version_label,
                    candidate.human_size(),
                    candidate.product.as_deref().unwrap_or("-")
                );
            }
        }

        Command::Preflight { json } => {
            let host = HostProfiler::new().detect();
            let probe = SystemProbe;
            let report = PreflightValidator::new(&config, &host, &probe).run();

            let missing = {
                let host = host.clone();
                tokio::task::spawn_blocking(move || {
                    deps::missing_packages(&host, &SystemRunner::new(false))
                })
                .await?
            };
            let advice = deps::install_command_line(host.package_manager, &missing);

            if json {
                let value = serde_json::json!({
                    "host": host,
                    "report": report,
                    "missing_packages": missing,
                    "install_command": advice,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "Host: {} ({}, {}, version {})",
                    host.distro_id, host.distro_family, host.package_manager, host.version_string
                );
                for issue in &report.issues {
                    let label = match issue.severity {
                        Severity::Error => "ERROR",
                        Severity::Warning => "WARN ",
                    };
                    println!("{} {}", label, issue.message);
                    if let Some(ref hint) = issue.hint {
                        println!("      {}", hint);
                    }
                }
                if let Some(command) = advice {
                    println!("\nMissing packages: {}", missing.join(", "));
                    println!("Install them with: {}", command);
                }
                println!("\nPreflight {}", if report.ok { "passed" } else { "failed" });
            }

            if !report.ok {
                process::exit(1);
            }
        }

        Command::Prepare { profile, dry_run } => {
            if let Some(profile) = profile {
                config.profile = profile;
            }
            config.dry_run = dry_run;

            tokio::task::spawn_blocking(move || prepare_prefix(&config)).await??;
        }

        Command::Repair {
            profile,
            dry_run,
            json,
        } => {
            if let Some(profile) = profile {
                config.profile = profile;
            }
            config.dry_run = dry_run;

            let runner: SharedRunner = SystemRunner::shared(config.dry_run);
            let host = HostProfiler::new().detect();
            let report = InstallationDriver::new(&config, runner, HttpClient::with_defaults()?, host)
                .repair()
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("Prefix:      {}", report.prefix.display());
            if !report.reinstalled.is_empty() {
                println!("Reinstalled: {}", report.reinstalled.join(", "));
            }
            for exe in &report.verified_executables {
                println!("Installed:   {}", exe.display());
            }
            for warning in &report.warnings {
                println!("Warning:     {}", warning);
            }
            if report.dry_run {
                println!("\nDry run: nothing was executed.");
            }
        }

        Command::Uninstall {
            runtime,
            cache,
            yes,
            dry_run,
            json,
        } => {
            config.dry_run = dry_run;
            if !yes && !dry_run {
                eprintln!("This will DELETE the Wine prefix and everything installed in it:");
                eprintln!("  {}", config.wine_prefix.display());
                if !confirm("Are you sure you want to continue? [y/N] ")? {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            let runner: SharedRunner = SystemRunner::shared(config.dry_run);
            let host = HostProfiler::new().detect();
            let request = UninstallRequest {
                remove_runtime: runtime,
                clear_cache: cache,
            };
            let report = InstallationDriver::new(&config, runner, HttpClient::with_defaults()?, host)
                .uninstall(&request)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            if report.removed.is_empty() {
                println!("Nothing to remove.");
            }
            let verb = if report.dry_run { "Would remove" } else { "Removed" };
            for path in &report.removed {
                println!("{}: {}", verb, path.display());
            }
        }

        Command::Fetch {
            download_url,
            sha256,
            dest,
        } => {
            config.ensure_dirs()?;
            let expected = sha256.or_else(|| config.expected_sha256.clone());
            let path = PayloadAcquirer::new(&config, HttpClient::with_defaults()?, true)
                .ensure(
                    dest.as_deref(),
                    download_url.as_deref(),
                    config.download_url.as_deref(),
                    expected.as_deref(),
                )
                .await?;
            println!("Installer ready at {}", path.display());
        }

        Command::Runtime => {
            config.ensure_dirs()?;
            let binary = RuntimeInstaller::new(&config, HttpClient::with_defaults()?, true)
                .ensure()
                .await
                .context("Failed to install the managed Wine build")?;
            println!("Wine ready at {}", binary.display());
        }

        Command::Status { json } => {
            let host = HostProfiler::new().detect();
            let runtime = {
                let config = config.clone();
                tokio::task::spawn_blocking(move || {
                    Runtime::detect(&config, &SystemRunner::new(false)).ok()
                })
                .await?
            };
            let prepared = std::fs::read_to_string(
                config.wine_prefix.join(affinity_lib::prefix::MARKER_NAME),
            )
            .ok()
            .and_then(|s| s.parse::<Profile>().ok());
            let prefix_exists = config.wine_prefix.join("drive_c").is_dir();
            let installed = find_installed_executables(&config.wine_prefix);
            let cached = config.universal_installer_path();

            if json {
                let value = serde_json::json!({
                    "host": host,
                    "runtime": runtime.as_ref().map(|r| serde_json::json!({
                        "wine": r.wine_bin,
                        "wineserver": r.wineserver_bin,
                        "version": r.version,
                    })),
                    "prefix": config.wine_prefix,
                    "prefix_exists": prefix_exists,
                    "prepared_profile": prepared,
                    "installed": installed,
                    "cached_installer": cached.is_file().then_some(&cached),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            println!(
                "Host:      {} ({}, {})",
                host.distro_id, host.distro_family, host.package_manager
            );
            match runtime {
                Some(ref r) => println!(
                    "Wine:      {} ({})",
                    r.wine_bin.display(),
                    r.version.as_deref().unwrap_or("unknown version")
                ),
                None => println!("Wine:      not found"),
            }
            println!(
                "Prefix:    {} ({})",
                config.wine_prefix.display(),
                if prefix_exists { "initialised" } else { "missing" }
            );
            println!(
                "Profile:   {}",
                prepared.map(|p| p.to_string()).unwrap_or_else(|| "not prepared".into())
            );
            if cached.is_file() {
                println!("Cached:    {}", cached.display());
            }
            if installed.is_empty() {
                println!("Installed: none");
            }
            for exe in installed {
                println!("Installed: {}", exe.display());
            }
        }
    }

    Ok(())
}

/// Initialise the prefix and bring it to the configured profile
fn prepare_prefix(config: &Config) -> anyhow::Result<()> {
    let runner = SystemRunner::new(config.dry_run);
    let runtime = Runtime::detect(config, &runner)?;
    runtime.ensure_prefix(&config.wine_prefix, &runner)?;

    let preparer = EnvironmentPreparer::new(&config.wine_prefix, &runtime, &runner);
    match preparer.prepare(config.profile)? {
        PrepareOutcome::AlreadySatisfied => {
            println!("Prefix already prepared with profile '{}'", config.profile)
        }
        PrepareOutcome::Prepared { installed } if installed.is_empty() => {
            println!("Prefix set to profile '{}'", config.profile)
        }
        PrepareOutcome::Prepared { installed } => {
            println!("Installed components: {}", installed.join(", "))
        }
    }
    if let VersionCheck::Error(e) = preparer.verify_version() {
        anyhow::bail!("Failed to query the prefix Windows version: {}", e);
    }
    Ok(())
}

/// Ask a yes/no question on the terminal
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("Refusing to delete without confirmation; pass --yes to proceed");
    }
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().to_lowercase().starts_with('y'))
}
