//! CLI tool for powerlens

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "powerlens")]
#[command(about = "powerlens: node energy counters, accelerator telemetry and per-process power estimates", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: ~/.config/powerlens/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "text", global = true)]
    format: String,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Take one snapshot of every source (default)
    Snapshot,
    /// Take a snapshot every sample interval
    Watch {
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Override the configured interval (milliseconds)
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },
    /// Show RAPL energy counters
    Energy,
    /// List compiled-in backends by role
    Backends,
    /// Evaluate a power model on the given usage values
    Predict {
        /// JSON weights file
        #[arg(short, long)]
        weights: PathBuf,
        /// Predictor family (default: configured predictor)
        #[arg(long)]
        family: Option<String>,
        /// Value of the first usage metric, one per sample
        values: Vec<f64>,
    },
    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(feature = "cli")]
fn main() {
    let cli = Cli::parse();

    env_logger::init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        let code = match e.downcast_ref::<powerlens::Error>() {
            Some(err) if err.is_configuration() => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

#[cfg(feature = "cli")]
fn load_config(cli: &Cli) -> powerlens::Result<powerlens::Config> {
    match &cli.config {
        Some(path) => powerlens::Config::load_from(path),
        None => powerlens::Config::load(),
    }
}

#[cfg(feature = "cli")]
fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    use powerlens::energy::RaplSysfs;
    use powerlens::PowerLens;

    let config = load_config(cli)?;
    let json = cli.format == "json";

    match &cli.command {
        Some(Commands::Energy) => {
            let rapl = RaplSysfs::new(&config.general.sys_root);
            print_energy(&rapl, json)?;
        }
        Some(Commands::Backends) => {
            let backends = powerlens::BackendRegistry::new();
            powerlens::device::sources::register_defaults(&backends, &config.general)?;
            print_backends(&backends, json)?;
        }
        Some(Commands::Predict {
            weights,
            family,
            values,
        }) => {
            let family = family.as_deref().unwrap_or(&config.model.predictor);
            let weights = powerlens::ModelWeights::from_file(weights)?;
            let names: Vec<&str> = weights.numerical_features.iter().map(String::as_str).collect();
            let predictor = powerlens::model::predictor_by_name(family, weights.clone())?;

            let rows: Vec<Vec<f64>> = values.iter().map(|v| vec![*v]).collect();
            let names = if names.is_empty() { vec!["x0"] } else { names };
            let power = predictor.predict(&names, &rows, &[], &[]);
            if json {
                println!("{}", serde_json::to_string_pretty(&power)?);
            } else {
                for (x, p) in values.iter().zip(&power) {
                    println!("{:>10.3} -> {:.3}", x, p);
                }
            }
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Init { force } => {
                let path = match &cli.config {
                    Some(path) => path.clone(),
                    None => powerlens::Config::default_path()?.join("config.toml"),
                };
                if path.exists() && !force {
                    return Err(format!("{} already exists (use --force)", path.display()).into());
                }
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                powerlens::Config::default().save_to(&path)?;
                println!("Wrote {}", path.display());
            }
        },
        Some(Commands::Watch { count, interval_ms }) => {
            let interval = interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| config.general.sample_interval());
            let lens = PowerLens::from_config(config)?;
            let mut taken = 0u64;
            loop {
                print_snapshot(&lens.snapshot(), json)?;
                taken += 1;
                if count.map(|n| taken >= n).unwrap_or(false) {
                    break;
                }
                std::thread::sleep(interval);
            }
            report_shutdown(&lens.shutdown());
        }
        Some(Commands::Snapshot) | None => {
            let lens = PowerLens::from_config(config)?;
            print_snapshot(&lens.snapshot(), json)?;
            report_shutdown(&lens.shutdown());
        }
    }

    Ok(())
}

#[cfg(feature = "cli")]
fn print_energy(
    rapl: &powerlens::RaplSysfs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use powerlens::energy::{EnergyEvent, NodeEnergySource};

    if !rapl.is_system_collection_supported() {
        return Err(powerlens::Error::NotSupported("RAPL counters are not readable".to_string()).into());
    }
    let components = rapl.abs_energy_from_node_components();
    if json {
        println!("{}", serde_json::to_string_pretty(&components)?);
        return Ok(());
    }

    println!("=== {} ===", rapl.name());
    for event in EnergyEvent::ALL {
        match (rapl.abs_energy(event), rapl.max_energy_range(event)) {
            (Ok(energy), Ok(max)) => println!("{:<8} {:>14} mJ (range {} mJ)", event, energy, max),
            (Ok(energy), Err(_)) => println!("{:<8} {:>14} mJ", event, energy),
            (Err(e), _) => println!("{:<8} {}", event, e),
        }
    }
    for (pkg, energy) in &components {
        println!(
            "package {}: pkg {} mJ, core {} mJ, uncore {} mJ, dram {} mJ",
            pkg, energy.pkg, energy.core, energy.uncore, energy.dram
        );
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn print_backends(
    backends: &powerlens::BackendRegistry,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::collections::BTreeMap;

    let by_role: BTreeMap<String, Vec<String>> = powerlens::DeviceRole::ALL
        .into_iter()
        .map(|role| (role.to_string(), backends.devices_for_role(role)))
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&by_role)?);
    } else {
        for (role, names) in &by_role {
            println!("{:<6} {}", role, names.join(", "));
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn print_snapshot(
    snapshot: &powerlens::Snapshot,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    println!("=== Snapshot {} ===", snapshot.timestamp.to_rfc3339());
    if snapshot.node.is_empty() {
        println!("{}: unavailable", snapshot.energy_source);
    } else {
        println!(
            "{}: {} mJ total package energy",
            snapshot.energy_source,
            snapshot.total_package_energy()
        );
        for (pkg, energy) in &snapshot.node {
            println!(
                "  package {}: core {} mJ, uncore {} mJ, dram {} mJ",
                pkg, energy.core, energy.uncore, energy.dram
            );
        }
    }

    for acc in &snapshot.accelerators {
        println!(
            "\n{} (running: {}, collecting: {})",
            acc.key, acc.running, acc.collection_supported
        );
        for (idx, energy) in acc.energy_mj.iter().enumerate() {
            println!("  device {}: {} mJ", idx, energy);
        }
        for (bdf, util) in &acc.device_utilization {
            println!(
                "  {}: cpr {} dcpr {} cph {} ath {} xlt {}, bw in/out {}/{}",
                bdf,
                util.cpr_util,
                util.dcpr_util,
                util.cph_util,
                util.ath_util,
                util.xlt_util,
                util.bw_in,
                util.bw_out
            );
        }
        for (device, procs) in &acc.process_power {
            for (pid, watts) in procs {
                println!("  device {} pid {}: {:.2} W", device, pid, watts);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn report_shutdown(report: &powerlens::ShutdownReport) {
    for (key, err) in report.failures() {
        log::warn!("failed to stop {}: {}", key, err);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI features not enabled. Please compile with --features cli");
    std::process::exit(1);
}
