use std::time::Duration;

use clap::Parser;
use pvars::client::SearcherBuilder;

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to search for
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Seconds to search for before giving up
    #[clap(short, long, default_value_t = 5.0)]
    timeout: f64,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let searcher = SearcherBuilder::new()
        .timeout(Some(Duration::from_secs_f64(opts.timeout)))
        .start()
        .await
        .unwrap();
    println!("Searching on {:?}", searcher.broadcast_addresses());

    for name in &opts.names {
        match searcher.search_for(name).await {
            Ok(address) => println!("{name}: {address}"),
            Err(e) => println!("{name}: {e}"),
        }
    }
}
