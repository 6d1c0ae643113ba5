use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Result, eyre};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use ufi::{
    Config, FarmerRecord, Filter, IdPolicy, Profile, ProfileCode, RandomIdGenerator, Registry, RegistrationForm,
    SeenIds, Store, link,
};

#[derive(Parser)]
#[command(name = "ufi")]
#[command(about = "UFI - register farmers, print their profile QR codes and look them up by UFI")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Path to the store directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    store_path: PathBuf,

    /// Config file (default: .ufi/config.yaml, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of profile links
    #[arg(long)]
    origin: Option<String>,

    /// UFI suffix policy: alphanumeric or numeric
    #[arg(long)]
    policy: Option<IdPolicy>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a farmer and print the assigned UFI with its QR code
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        village: String,
        #[arg(long)]
        crop: String,
        #[arg(long)]
        land: String,
        /// Krishi Vigyan Kendra
        #[arg(long)]
        kvk: Option<String>,
        /// Also write the QR code as SVG
        #[arg(long)]
        svg: Option<PathBuf>,
        /// Skip the terminal QR code
        #[arg(long)]
        no_qr: bool,
    },

    /// Show a farmer profile by UFI or profile URL
    Show {
        id: String,
        /// Fail on unknown UFIs instead of showing the placeholder profile
        #[arg(long)]
        strict: bool,
    },

    /// List registered farmers
    List {
        #[arg(long)]
        village: Option<String>,
        #[arg(long)]
        crop: Option<String>,
        #[arg(long)]
        kvk: Option<String>,
        /// Match names containing this text
        #[arg(long)]
        search: Option<String>,
    },

    /// Print the profile QR code for a UFI
    Qr {
        id: String,
        #[arg(long)]
        svg: Option<PathBuf>,
    },

    /// Follow registrations made by other processes
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Rebuild the lookup index from the farmers slot
    Sync,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let mut config = Config::load(cli.config.as_deref(), &cli.store_path)?;
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }
    if let Some(policy) = cli.policy {
        config.id_policy = policy;
    }

    let store = Store::open(&cli.store_path)?;
    let mut registry = Registry::new(store, RandomIdGenerator::new(config.id_policy), &config);

    match cli.command {
        Commands::Register {
            name,
            phone,
            village,
            crop,
            land,
            kvk,
            svg,
            no_qr,
        } => {
            let form = RegistrationForm {
                name,
                phone,
                village,
                crop,
                land,
                kvk,
            };
            let registration = registry.register(form)?;

            println!("{} {}", "UFI Generated:".bold(), registration.id().green().bold());

            let code = registry.profile_code(registration.id())?;
            if !no_qr {
                println!("{}", code.to_terminal());
            }
            println!("{}", code.url().dimmed());
            write_svg(&code, svg)?;
        }
        Commands::Show { id, strict } => {
            let id = link::id_from_path(&id).unwrap_or(&id).to_string();
            let profile = if strict {
                registry.profile_with(&id, false)?
            } else {
                registry.profile(&id)?
            };

            match profile {
                Profile::Found(record) => print_profile(&record),
                Profile::Placeholder(record) => {
                    eprintln!("{}", format!("No farmer registered with UFI {}", id).yellow());
                    print_profile(&record);
                }
                Profile::NotFound => return Err(eyre!("No farmer registered with UFI {}", id)),
            }
        }
        Commands::List {
            village,
            crop,
            kvk,
            search,
        } => {
            let mut filters = Vec::new();
            if let Some(village) = village {
                filters.push(Filter::eq("village", village));
            }
            if let Some(crop) = crop {
                filters.push(Filter::eq("crop", crop));
            }
            if let Some(kvk) = kvk {
                filters.push(Filter::eq("kvk", kvk));
            }
            if let Some(search) = search {
                filters.push(Filter::contains("name", search));
            }

            let records = registry.store().list(&filters)?;
            for record in &records {
                println!(
                    "{}  {}  {}  {}  {}",
                    record.id.green(),
                    record.name.bold(),
                    record.village,
                    record.crop,
                    record.land
                );
            }
            println!("{}", format!("{} farmer(s)", records.len()).dimmed());
        }
        Commands::Qr { id, svg } => {
            if !registry.store().contains_id(&id)? {
                eprintln!("{}", format!("Warning: {} is not registered in this store", id).yellow());
            }
            let code = registry.profile_code(&id)?;
            println!("{}", code.to_terminal());
            println!("{}", code.url().dimmed());
            write_svg(&code, svg)?;
        }
        Commands::Watch { interval_ms } => {
            let interval = Duration::from_millis(interval_ms.unwrap_or(config.watch_interval_ms).max(1));
            println!(
                "Profile links: {}  UFI policy: {} ({} possible ids)",
                link::profile_url(registry.origin(), "<UFI>"),
                config.id_policy,
                config.id_policy.space_size()
            );

            let store = registry.store();
            let existing = store.records()?;
            println!("Watching {} ({} farmers)", store.slot_path().display(), existing.len());

            let mut seen = SeenIds::from_records(&existing);
            store.subscribe(move |records: &[FarmerRecord]| {
                let delta = seen.update(records);
                if delta.is_replacement() {
                    let message = format!(
                        "Store replaced: {} earlier farmer(s) gone, now holds {}",
                        delta.removed,
                        records.len()
                    );
                    println!("{}", message.yellow());
                }
                for record in delta.added {
                    println!("{} {} ({})", "+".green(), record.id.green(), record.name);
                }
            });

            loop {
                store.poll_changes()?;
                thread::sleep(interval);
            }
        }
        Commands::Sync => {
            println!("Rebuilding lookup index from slot...");
            let count = registry.store().sync()?;
            println!("Sync complete ({} farmers)", count);
        }
    }

    Ok(())
}

fn print_profile(record: &FarmerRecord) {
    println!("{}", "Farmer Profile".bold());
    println!("  {:<8} {}", "Name:".bold(), record.name);
    println!("  {:<8} {}", "Phone:".bold(), record.phone);
    println!("  {:<8} {}", "Village:".bold(), record.village);
    println!("  {:<8} {}", "Crops:".bold(), record.crop);
    println!("  {:<8} {}", "Land:".bold(), record.land);
    println!("  {:<8} {}", "KVK:".bold(), record.kvk.as_deref().unwrap_or("-"));
    let id = if record.id.is_empty() { "-" } else { record.id.as_str() };
    println!("  {:<8} {}", "UFI:".bold(), id);
}

fn write_svg(code: &ProfileCode, path: Option<PathBuf>) -> Result<()> {
    if let Some(path) = path {
        code.write_svg(&path)?;
        println!("QR code written to {}", path.display());
    }
    Ok(())
}
