use catalog_cache::cache::CacheEvent;
use catalog_cache::catalog::{
  ApiError, CachedCatalog, CatalogClient, CatalogKey, CreateProductInput, Product,
};
use catalog_cache::config::{Config, ServerConfig};
use catalog_cache::mutation::MutationOutcome;
use catalog_cache::{logging, server};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "catalog")]
#[command(about = "Product catalog with an optimistic-update client cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./catalog.yaml or $XDG_CONFIG_HOME/catalog/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the mock catalog API
  Serve {
    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,
    /// Probability that a mutating request fails with a 500
    #[arg(long)]
    failure_rate: Option<f64>,
    /// Delay added to every response
    #[arg(long)]
    latency_ms: Option<u64>,
  },
  /// List products
  List {
    #[arg(short, long, default_value = "")]
    search: String,
  },
  /// Show one product, using the list entry as placeholder
  Show {
    id: String,
    #[arg(short, long, default_value = "")]
    search: String,
  },
  /// Toggle a product's favorite flag
  Favorite {
    id: String,
    #[arg(short, long, default_value = "")]
    search: String,
  },
  /// Create a product
  Create {
    #[arg(long)]
    name: String,
    #[arg(long)]
    price: f64,
    #[arg(short, long, default_value = "")]
    search: String,
  },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Serve {
      bind,
      failure_rate,
      latency_ms,
    } => {
      let server_config = ServerConfig {
        bind: bind.unwrap_or(config.server.bind),
        failure_rate: failure_rate.unwrap_or(config.server.failure_rate),
        latency_ms: latency_ms.unwrap_or(config.server.latency_ms),
      };
      server::run(&server_config).await
    }
    Command::List { search } => {
      let catalog = CachedCatalog::from_config(&config)?;
      let products = catalog.products(&search).await?;
      print_products(&CatalogKey::products(&search).description(), &products);
      Ok(())
    }
    Command::Show { id, search } => {
      let catalog = CachedCatalog::from_config(&config)?;
      show(&catalog, &id, &search).await
    }
    Command::Favorite { id, search } => {
      let catalog = CachedCatalog::from_config(&config)?;
      let outcome =
        with_list_watch(&catalog, &search, || catalog.toggle_favorite(&id, &search)).await?;
      report(&outcome)
    }
    Command::Create {
      name,
      price,
      search,
    } => {
      let catalog = CachedCatalog::from_config(&config)?;
      let input = CreateProductInput { name, price };
      let outcome =
        with_list_watch(&catalog, &search, || catalog.create_product(input, &search)).await?;
      report(&outcome)
    }
  }
}

async fn show(catalog: &CachedCatalog<CatalogClient>, id: &str, search: &str) -> Result<()> {
  // Load the list first so the detail view has something to show right away
  catalog.products(search).await?;

  let mut query = catalog.product_query(id, search)?;
  query.fetch();
  if let Some(placeholder) = query.data() {
    print_products("placeholder", &placeholder.clone().into_vec());
  }

  while query.is_loading() {
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();
  }

  match (query.data(), query.error()) {
    (Some(data), _) => {
      print_products(&CatalogKey::product(id).description(), &data.clone().into_vec());
      Ok(())
    }
    (None, Some(error)) => Err(eyre!("Failed to load product {}: {}", id, error)),
    (None, None) => Err(eyre!("Product {} was not loaded", id)),
  }
}

/// Run a mutation while printing every change to the list for `search`,
/// then wait for the settlement refetch and print the final list.
async fn with_list_watch<F, Fut>(
  catalog: &CachedCatalog<CatalogClient>,
  search: &str,
  mutate: F,
) -> Result<MutationOutcome<Product, ApiError>>
where
  F: FnOnce() -> Fut,
  Fut: std::future::Future<Output = MutationOutcome<Product, ApiError>>,
{
  let description = CatalogKey::products(search).description();
  let before = catalog.products(search).await?;
  print_products(&format!("{} (before)", description), &before);

  // Keeps the list observed so settlement refetches it
  let _list = catalog.products_query(search)?;
  let watcher = watch_list(catalog, search);

  let outcome = mutate().await;
  info!(transitions = ?outcome.transitions, "mutation settled");

  catalog
    .cache()
    .wait_idle(&CatalogKey::all_products())
    .await?;
  watcher.abort();

  let after = catalog
    .cache()
    .store()
    .read(&CatalogKey::products(search).query_key())?
    .map(|data| data.into_vec())
    .unwrap_or_default();
  print_products(&format!("{} (settled)", description), &after);

  Ok(outcome)
}

fn watch_list(catalog: &CachedCatalog<CatalogClient>, search: &str) -> JoinHandle<()> {
  let cache = catalog.cache().clone();
  let mut events = cache.subscribe();
  let key = CatalogKey::products(search).query_key();

  tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(CacheEvent::Updated(updated)) if updated == key => {
          if let Ok(Some(data)) = cache.store().read(&key) {
            print_products(&format!("{} (cache update)", key), &data.into_vec());
          }
        }
        Ok(_) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => break,
      }
    }
  })
}

fn report(outcome: &MutationOutcome<Product, ApiError>) -> Result<()> {
  match &outcome.result {
    Ok(product) => {
      println!("confirmed: {} ({})", product.name, product.id);
      Ok(())
    }
    Err(e) => Err(eyre!("rolled back: {}", e)),
  }
}

fn print_products(title: &str, products: &[Product]) {
  println!("{}:", title);
  if products.is_empty() {
    println!("  (none)");
  }
  for product in products {
    println!(
      "  {:<16} {:<24} {:>9.2} {}",
      product.id,
      product.name,
      product.price,
      if product.favorite { "*" } else { "" }
    );
  }
}
