use clap::Parser;
use pvars::{Client, data::PvaData};

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV to write to
    name: String,
    /// New value. Numbers are sent as numbers, anything else as text.
    value: String,
    /// Field to write
    #[clap(short, long, default_value = "value")]
    field: String,
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

    // The server converts into the type of the field
    let value: PvaData = match opts.value.parse::<f64>() {
        Ok(number) => number.into(),
        Err(_) => opts.value.as_str().into(),
    };

    let client = Client::new().await.unwrap();
    let channel = client.channel(&opts.name);
    let old = channel.read(&opts.field).await;
    match channel.write(&opts.field, value).await {
        Ok(()) => {
            if let Ok(old) = old {
                println!("Old: {old}");
            }
            match channel.read(&opts.field).await {
                Ok(new) => println!("New: {new}"),
                Err(e) => println!("Could not read back {}: {e}", opts.name),
            }
        }
        Err(e) => {
            println!("Write to {} failed: {e}", opts.name);
            std::process::exit(1);
        }
    }
    channel.close().await;
}
