use clap::Parser;
use pvars::{ChannelState, Client};

use tracing::{info, level_filters::LevelFilter};

#[derive(Parser)]
struct Options {
    /// PV names to monitor
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Fields to monitor, e.g. "value,timeStamp"
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
    let mut subscriptions = Vec::new();
    for name in &opts.names {
        let channel = client.channel(name);
        let label = name.clone();
        let subscription = channel
            .subscribe(&opts.request, move |event| {
                let changed: Vec<_> = event
                    .changes
                    .iter()
                    .filter_map(|index| event.value.path_of_index(index))
                    .collect();
                if event.overrun_count > 0 {
                    println!("{label} ({} updates missed)", event.overrun_count);
                }
                println!("{label} changed [{}]: {}", changed.join(", "), event.value);
            })
            .unwrap();

        let mut state = channel.watch_state();
        let label = name.clone();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                match current {
                    ChannelState::Connected => info!("{label} connected"),
                    ChannelState::Disconnected => println!("{label} disconnected"),
                    _ => (),
                }
            }
        });
        subscriptions.push(subscription);
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl-C: Shutting down");
    for subscription in subscriptions {
        subscription.cancel();
    }
}
