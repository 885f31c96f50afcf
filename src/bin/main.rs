use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rust_decimal::Decimal;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crypto_portfolio::history::PriceHistory;
use crypto_portfolio::marketplace::binance::{
    Binance, BinanceTickerStream, StreamConfig, DEFAULT_QUOTE, SUPPORTED_SYMBOLS,
};
use crypto_portfolio::marketplace::{SubscriptionRegistry, Tick};
use crypto_portfolio::portfolio::{PortfolioFeed, PortfolioStore};
use crypto_portfolio::storage::FileStorage;
use crypto_portfolio::ticker::Symbol;

#[derive(Parser, Debug)]
struct Args {
    /// Directory holding the persisted portfolio
    #[arg(long, env = "PORTFOLIO_STORE_PATH", default_value = ".portfolio")]
    store_path: PathBuf,
    #[arg(long, env = "PORTFOLIO_QUOTE", default_value = DEFAULT_QUOTE)]
    quote: String,
    #[arg(long, env = "PORTFOLIO_RECONNECT_DELAY_MS", default_value_t = 5000)]
    reconnect_delay_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the stored portfolio
    Show,
    /// List supported currencies with their last price
    Currencies {
        /// Keep printing live prices until ctrl-c
        #[arg(long)]
        watch: bool,
    },
    Add {
        symbol: String,
        amount: Decimal,
        /// Defaults to the last traded price
        #[arg(long)]
        price: Option<Decimal>,
    },
    Remove {
        id: Uuid,
    },
    /// Stream live prices into the portfolio until ctrl-c
    Watch,
    /// Follow the recent price window of one symbol until ctrl-c
    Chart {
        symbol: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=debug,crypto_portfolio=debug", env!("CARGO_CRATE_NAME")).into()
        }))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = StreamConfig {
        quote: args.quote.to_uppercase(),
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        ..Default::default()
    };
    let store = Arc::new(PortfolioStore::load(Arc::new(FileStorage::new(
        args.store_path.clone(),
    ))));

    match args.command.unwrap_or(Commands::Show) {
        Commands::Show => print!("{}", store.snapshot()),
        Commands::Currencies { watch } => run_currencies(config, watch).await?,
        Commands::Add {
            symbol,
            amount,
            price,
        } => {
            let price = match price {
                Some(price) => price,
                None => last_price(&store, &symbol, &config.quote).await?,
            };
            let id = store.add_holding(&symbol, amount, price)?;
            println!("Added {}", id.to_string().green());
            print!("{}", store.snapshot());
        }
        Commands::Remove { id } => {
            if !store.remove_holding(id) {
                bail!("No holding with id {id}");
            }
            print!("{}", store.snapshot());
        }
        Commands::Watch => run_watch(store.clone(), config).await?,
        Commands::Chart { symbol } => run_chart(&symbol, config).await?,
    }

    store.flush().await;
    Ok(())
}

async fn run_currencies(config: StreamConfig, watch: bool) -> Result<()> {
    let choices = Binance::new()?.get_currency_choices(&config.quote).await;
    if choices.is_empty() && !watch {
        bail!("No currency available, is the market reachable?");
    }
    for choice in choices {
        print_price(&choice.symbol, choice.price, choice.change_24h);
    }

    if watch {
        run_currencies_watch(config).await?;
    }
    Ok(())
}

fn print_price(symbol: &Symbol, price: Decimal, change_24h: Decimal) {
    let change = change_24h.round_dp(2).normalize();
    let change = if change.is_sign_negative() {
        format!("{change}%").red()
    } else {
        format!("+{change}%").green()
    };
    println!("{}: {} {}", symbol, price.to_string().yellow(), change);
}

async fn run_currencies_watch(config: StreamConfig) -> Result<()> {
    let registry = SubscriptionRegistry::new(BinanceTickerStream::new(config)?);
    let subscriptions: Vec<_> = SUPPORTED_SYMBOLS
        .iter()
        .flat_map(|symbol| Symbol::new(symbol))
        .map(|symbol| {
            registry.subscribe(symbol, |tick: &Tick| {
                print_price(&tick.symbol, tick.price, tick.change_24h);
                Ok(())
            })
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Stopping currencies watch");
    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    registry.shutdown();
    Ok(())
}

async fn last_price(store: &PortfolioStore, symbol: &str, quote: &str) -> Result<Decimal> {
    let symbol = Symbol::new(symbol)?;
    let binance = Binance::new()?;

    store.set_loading(true);
    let prices = binance.get_initial_prices(&[symbol.clone()], quote).await;
    store.set_loading(false);

    match prices.get(&symbol) {
        Some(snapshot) => Ok(snapshot.price),
        None => {
            let message = format!("No price available for {symbol}{quote}");
            store.set_error(Some(message.clone()));
            bail!(message)
        }
    }
}

/// Seeds held prices from the snapshot endpoint before the stream takes over.
async fn refresh_prices(store: &PortfolioStore, quote: &str) -> Result<()> {
    let symbols: Vec<Symbol> = store.snapshot().symbols().into_iter().collect();
    if symbols.is_empty() {
        return Ok(());
    }
    let binance = Binance::new()?;

    store.set_loading(true);
    let prices = binance.get_initial_prices(&symbols, quote).await;
    for (symbol, snapshot) in prices.iter() {
        store.apply_price_update(symbol, snapshot.price, snapshot.change_24h);
    }
    store.set_loading(false);

    if prices.is_empty() {
        store.set_error(Some(String::from("Failed to fetch initial prices")));
    } else {
        store.set_error(None);
    }
    Ok(())
}

async fn run_watch(store: Arc<PortfolioStore>, config: StreamConfig) -> Result<()> {
    refresh_prices(&store, &config.quote).await?;

    let registry = SubscriptionRegistry::new(BinanceTickerStream::new(config)?);
    let mut rx = store.subscribe();
    let feed = tokio::spawn(PortfolioFeed::new(registry.clone(), store.clone()).run());

    print!("{}", store.snapshot());
    loop {
        select! {
            update = rx.recv() => match update {
                Ok(state) => print!("{state}"),
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {skipped} portfolio updates"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch");
                break;
            }
        }
    }

    feed.abort();
    registry.shutdown();
    Ok(())
}

async fn run_chart(symbol: &str, config: StreamConfig) -> Result<()> {
    let symbol = Symbol::new(symbol)?;
    let registry = SubscriptionRegistry::new(BinanceTickerStream::new(config)?);
    let history = PriceHistory::default();
    let subscription = history.track(&registry, symbol.clone());

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        select! {
            _ = interval.tick() => {
                let points = history.points(&symbol);
                let Some(last) = points.last() else {
                    continue;
                };
                let (low, high) = points.iter().fold((last.price, last.price), |(low, high), point| {
                    (low.min(point.price), high.max(point.price))
                });
                println!(
                    "{} {}: {} [{} - {}] ({} points)",
                    last.time.format("%H:%M:%S"),
                    symbol,
                    last.price.to_string().yellow(),
                    low,
                    high,
                    points.len()
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping chart");
                break;
            }
        }
    }

    history.untrack(subscription);
    registry.shutdown();
    Ok(())
}
