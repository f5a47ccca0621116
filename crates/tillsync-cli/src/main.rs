//! Tillsync CLI
//!
//! Thin wrapper around tillsync-core for command-line usage. The remote
//! authority is an in-process stand-in and the print sink writes to
//! stdout, so every command runs self-contained against the local data
//! directory.
//!
//! ## Usage
//!
//! ```bash
//! # Show till information
//! tillsync info
//!
//! # Seed the catalog
//! tillsync product add p1 "Burger" 5.99
//!
//! # List the catalog
//! tillsync product list
//!
//! # Place an order (items as JSON)
//! tillsync order place o1 --items '[{"id":"p1","name":"Burger","price":5.99,"qty":2}]'
//!
//! # List orders
//! tillsync order list
//!
//! # Advance an order through its lifecycle
//! tillsync order status o1 ready
//!
//! # Spool a print job for a stored order
//! tillsync print add kitchen o1 --priority 3
//!
//! # List print jobs
//! tillsync print jobs
//!
//! # Reconcile a collection (or all synced collections)
//! tillsync sync orders
//!
//! # Drain the offline write queue
//! tillsync flush
//!
//! # Show queue/connectivity state
//! tillsync status
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tillsync_core::{
    Collection, Connectivity, ConsoleSink, MemoryTransport, Order, OrderItem, OrderStatus,
    PrintJob, Till, TillConfig,
};

/// Tillsync - Offline-first Point of Sale
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(version = "0.1.0")]
#[command(about = "Tillsync - Offline-first Point of Sale")]
#[command(
    long_about = "An offline-first point-of-sale data layer: orders stay locally durable while disconnected and reconcile with the remote authority on reconnect."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.tillsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Start with connectivity down (writes queue instead of pushing)
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show till information
    Info,

    /// Show queue and connectivity state
    Status,

    /// Catalog management
    Product {
        #[command(subcommand)]
        action: ProductAction,
    },

    /// Order management
    Order {
        #[command(subcommand)]
        action: OrderAction,
    },

    /// Print queue management
    Print {
        #[command(subcommand)]
        action: PrintAction,
    },

    /// Reconcile collections with the remote authority
    Sync {
        /// Collection to sync (default: all synced collections)
        collection: Option<String>,
    },

    /// Drain the offline write queue once
    Flush,
}

#[derive(Subcommand)]
enum ProductAction {
    /// Add or update a catalog product
    Add {
        id: String,
        name: String,
        price: f64,
        /// Category shown on bar slips (e.g. "Drink")
        #[arg(short, long)]
        category: Option<String>,
    },
    /// List the catalog
    List,
}

#[derive(Subcommand)]
enum OrderAction {
    /// Place an order
    Place {
        id: String,
        /// Line items as a JSON array
        #[arg(long)]
        items: String,
        /// Override the computed total
        #[arg(long)]
        total: Option<f64>,
    },
    /// List stored orders
    List,
    /// Update an order's lifecycle status
    Status { id: String, status: String },
}

#[derive(Subcommand)]
enum PrintAction {
    /// Spool a print job for a stored order
    Add {
        /// Destination: receipt, kitchen, or bar
        destination: String,
        /// Id of a stored order to render
        order_id: String,
        #[arg(short, long, default_value_t = 1)]
        priority: u8,
    },
    /// List persisted print jobs
    Jobs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let connectivity = Connectivity::new(!cli.offline);
    let till = Till::new(
        &data_dir,
        MemoryTransport::new(),
        ConsoleSink,
        connectivity.clone(),
        TillConfig::default(),
    )
    .await?;

    match cli.command {
        Commands::Info => {
            println!("Tillsync v0.1.0");
            println!();
            println!("Data directory: {}", till.data_dir().display());
            println!("Products: {}", till.products()?.len());
            println!("Orders: {}", till.orders()?.len());
            println!(
                "Queued writes: {} ({})",
                till.queue().len(),
                if connectivity.is_online() {
                    "online"
                } else {
                    "offline"
                }
            );
        }

        Commands::Status => {
            println!(
                "Connectivity: {}",
                if connectivity.is_online() {
                    "online"
                } else {
                    "offline"
                }
            );
            println!("Queued writes: {}", till.queue().len());
            println!("Current backoff: {:?}", till.queue().current_backoff());
            println!("Pending print jobs: {}", till.printer().pending().len());
        }

        Commands::Product { action } => match action {
            ProductAction::Add {
                id,
                name,
                price,
                category,
            } => {
                let mut product = tillsync_core::Product::new(id, name, price);
                product.category = category;
                till.upsert_product(product.clone()).await?;
                println!("Product saved:");
                println!("  ID: {}", product.id);
                println!("  Name: {}", product.name);
                println!("  Price: ${:.2}", product.price);
            }
            ProductAction::List => {
                let products = till.products()?;
                if products.is_empty() {
                    println!("No products.");
                } else {
                    println!("Products ({}):", products.len());
                    for product in products {
                        println!("  {} - {} (${:.2})", product.id, product.name, product.price);
                    }
                }
            }
        },

        Commands::Order { action } => match action {
            OrderAction::Place { id, items, total } => {
                let items: Vec<OrderItem> =
                    serde_json::from_str(&items).context("items must be a JSON array")?;
                let computed: f64 = items
                    .iter()
                    .map(|item| f64::from(item.qty) * item.price)
                    .sum();

                let mut order = Order::new(id);
                order.items = items;
                order.total = total.unwrap_or(computed);

                let order_id = till.place_order(order).await?;
                settle(&till).await;
                println!("Order placed:");
                println!("  ID: {}", order_id);
            }
            OrderAction::List => {
                let orders = till.orders()?;
                if orders.is_empty() {
                    println!("No orders.");
                } else {
                    println!("Orders ({}):", orders.len());
                    for order in orders {
                        println!(
                            "  {} - ${:.2} [{}] updated {}",
                            order.id,
                            order.total,
                            order.status,
                            format_timestamp(order.updated_at)
                        );
                    }
                }
            }
            OrderAction::Status { id, status } => {
                let status: OrderStatus = status.parse()?;
                till.update_order_status(&id, status).await?;
                println!("Order {} -> {}", id, status);
            }
        },

        Commands::Print { action } => match action {
            PrintAction::Add {
                destination,
                order_id,
                priority,
            } => {
                let record = till
                    .storage()
                    .get(Collection::Orders, &order_id)?
                    .with_context(|| format!("no stored order '{}'", order_id))?;
                let job_id =
                    till.printer()
                        .add_job_named(&destination, record.to_value()?, priority)?;
                settle(&till).await;
                println!("Print job spooled:");
                println!("  ID: {}", job_id.to_string_repr());
            }
            PrintAction::Jobs => {
                let records = till.storage().get_all(Collection::PrintJobs)?;
                if records.is_empty() {
                    println!("No print jobs.");
                } else {
                    println!("Print jobs ({}):", records.len());
                    for record in &records {
                        let job = PrintJob::from_record(record)?;
                        println!(
                            "  {} -> {} [{:?}] order {} tries {}",
                            job.id.to_string_repr(),
                            job.destination,
                            job.status,
                            job.order_id,
                            job.tries
                        );
                    }
                }
            }
        },

        Commands::Sync { collection } => {
            let collections: Vec<Collection> = match collection {
                Some(name) => {
                    let collection: Collection = name.parse()?;
                    if !Collection::SYNCED.contains(&collection) {
                        bail!("collection '{}' is device-local and does not sync", collection);
                    }
                    vec![collection]
                }
                None => Collection::SYNCED.to_vec(),
            };
            for collection in collections {
                till.sync().sync_collection(collection).await?;
                println!(
                    "Synced {} (watermark {})",
                    collection,
                    format_timestamp(till.storage().watermark(collection)?)
                );
            }
        }

        Commands::Flush => {
            let failed = till.queue().flush().await?;
            if failed == 0 {
                println!("Queue drained.");
            } else {
                println!("{} write(s) still undeliverable.", failed);
            }
        }
    }

    Ok(())
}

/// Let spooled print jobs reach the console sink before the process exits.
async fn settle<T, S>(till: &Till<T, S>)
where
    T: tillsync_core::RemoteTransport + 'static,
    S: tillsync_core::DeliverySink + 'static,
{
    for _ in 0..50 {
        if till.printer().pending().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn format_timestamp(millis: i64) -> String {
    if millis == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.tillsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tillsync")
        .join("data")
}
