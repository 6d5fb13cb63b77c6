use clap::Parser;
use pvars::Client;

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Fields to read, e.g. "value,alarm"
    #[clap(short, long, default_value = "")]
    request: String,
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

    let client = Client::new().await.unwrap();
    let channels: Vec<_> = opts.names.iter().map(|name| client.channel(name)).collect();
    for channel in channels {
        match channel.read(&opts.request).await {
            Ok(value) => println!("{} {value}", channel.name()),
            Err(e) => println!("{} failed: {e}", channel.name()),
        }
        channel.close().await;
    }
}
