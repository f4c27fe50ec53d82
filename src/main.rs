//! # device-enrich CLI (`denrich`)
//!
//! ## Usage
//!
//! ```bash
//! denrich --config ./config/denrich.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `denrich init` | Create the store database and its tables |
//! | `denrich run [--clean] [--learn]` | Correct and enrich every input file |
//! | `denrich clean` | Clean input files in place |
//! | `denrich learn` | Fold input records into the model table |
//! | `denrich vendors list\|add <name>` | Inspect or extend the vendor set |
//! | `denrich models get\|set <model>` | Inspect or edit one model entry |
//! | `denrich stats` | Store and run-state overview |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use device_enrich::error::PipelineError;
use device_enrich::geocode::GeocodeFetcher;
use device_enrich::ingest::Pipeline;
use device_enrich::kv::{KvStore, SqliteKv};
use device_enrich::mapping::MappingStore;
use device_enrich::models::ModelDetails;
use device_enrich::{clean, config, learn, logging, migrate, stats};

/// Corrects device fields and enriches event records with reverse-geocoded
/// locations, one row-group at a time.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/denrich.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "denrich", version, about = "Device correction and location enrichment for Parquet event files")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/denrich.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema. Safe to run repeatedly.
    Init,

    /// Process every input file: correct, enrich, write, and record status.
    ///
    /// Files are processed in name order. A failing file is marked
    /// `failed` in the status ledger and left in place; the run continues.
    Run {
        /// Clean input files in place before processing.
        #[arg(long)]
        clean: bool,

        /// Learn model details from the inputs before processing.
        #[arg(long)]
        learn: bool,
    },

    /// Clean input files in place without processing them.
    Clean,

    /// Fold the inputs' vendor/model/height/width into the model table.
    Learn,

    /// Inspect or extend the vendor set.
    Vendors {
        #[command(subcommand)]
        action: VendorsAction,
    },

    /// Inspect or edit model table entries.
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Show store sizes, the last checkpoint, and ledger counts.
    Stats,
}

#[derive(Subcommand)]
enum VendorsAction {
    /// List known vendors, longest first.
    List,
    /// Add a vendor token.
    Add { name: String },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// Print the stored details for a model.
    Get { model: String },
    /// Store details for a model.
    Set {
        model: String,
        #[arg(long, default_value = "")]
        vendor: String,
        #[arg(long, default_value = "")]
        height: String,
        #[arg(long, default_value = "")]
        width: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(if cli.verbose { "debug" } else { "info" })?;

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Store initialized at {}", cfg.store.path.display());
        return Ok(());
    }

    let store = Arc::new(SqliteKv::open(&cfg).await.map_err(PipelineError::store)?);
    let kv: Arc<dyn KvStore> = store.clone();
    let mapping = MappingStore::new(kv.clone(), cfg.vendors.default_list());

    match cli.command {
        Commands::Init => {}
        Commands::Run {
            clean: do_clean,
            learn: do_learn,
        } => {
            if do_clean {
                clean::clean_inputs(&cfg).await?.print();
            }
            if do_learn {
                learn::learn_from_inputs(&cfg, &mapping).await?.print();
            }
            let fetcher = GeocodeFetcher::from_config(&cfg.geocoder)?;
            let pipeline = Pipeline::new(cfg.clone(), kv.clone(), fetcher);
            match pipeline.run().await {
                Ok(summary) => summary.print(),
                Err(e) => {
                    let fatal = e
                        .downcast_ref::<PipelineError>()
                        .is_some_and(PipelineError::is_fatal);
                    if fatal {
                        error!(error = %e, "store unavailable, aborting run");
                    }
                    store.close().await;
                    return Err(e);
                }
            }
        }
        Commands::Clean => {
            clean::clean_inputs(&cfg).await?.print();
        }
        Commands::Learn => {
            learn::learn_from_inputs(&cfg, &mapping).await?.print();
        }
        Commands::Vendors { action } => match action {
            VendorsAction::List => {
                let vendors = mapping.load_or_create_vendors().await?;
                for vendor in vendors.iter() {
                    println!("{}", vendor);
                }
            }
            VendorsAction::Add { name } => {
                mapping.load_or_create_vendors().await?;
                if mapping.save_vendor(&name).await? {
                    println!("added {}", name.trim().to_lowercase());
                } else {
                    println!("already known: {}", name.trim().to_lowercase());
                }
            }
        },
        Commands::Models { action } => match action {
            ModelsAction::Get { model } => match mapping.get_model(&model).await? {
                Some(details) => println!("{}", serde_json::to_string_pretty(&details)?),
                None => println!("not found: {}", model),
            },
            ModelsAction::Set {
                model,
                vendor,
                height,
                width,
            } => {
                let details = ModelDetails::new(vendor, height, width);
                if mapping.update_model_mapping(&model, &details).await? {
                    println!("updated {}", model.trim().to_lowercase());
                } else {
                    println!("unchanged {}", model.trim().to_lowercase());
                }
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg, &kv).await?;
        }
    }

    store.close().await;
    Ok(())
}
