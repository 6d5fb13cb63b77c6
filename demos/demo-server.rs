use std::time::{Duration, SystemTime};

use clap::Parser;
use pvars::{
    ServerBuilder,
    codec::BitSet,
    data::{PvaData, Structure, nt},
    providers::{PvRegistry, ServerPv},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};

#[derive(Parser)]
struct Options {
    /// Name of the writable PV
    #[clap(default_value = "demo")]
    name: String,
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

    let shutdown = CancellationToken::new();
    let registry = PvRegistry::new();

    // Writing a negative number to the demo PV stops the server
    let stop_on_negative = shutdown.clone();
    registry
        .create_pv_with_handler(
            &opts.name,
            nt::NtScalar::new(3.13)
                .description("Write a negative value to shut down")
                .build()
                .unwrap(),
            move |pv: &ServerPv, _: &BitSet, mut proposed: Structure| {
                let value = proposed
                    .get("value")
                    .and_then(PvaData::as_f64)
                    .unwrap_or_default();
                nt::set_time(&mut proposed, SystemTime::now()).map_err(|e| e.to_string())?;
                pv.update(&proposed).map_err(|e| e.to_string())?;
                if value < 0.0 {
                    info!("Asked to shut down by writing {value}");
                    stop_on_negative.cancel();
                }
                Ok(())
            },
        )
        .unwrap();
    let counter = registry
        .create_pv(
            &format!("{}:counter", opts.name),
            nt::NtScalar::new(0i32).build().unwrap(),
        )
        .unwrap();

    let server = ServerBuilder::new(registry).start().await.unwrap();
    info!("Serving {} and {}", opts.name, counter.name());

    let mut ticks = tokio::time::interval(Duration::from_secs(1));
    let mut count = 0i32;
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                println!("Ctrl-C: Shutting down");
                break;
            },
            _ = ticks.tick() => {
                count += 1;
                let mut value = counter.value();
                if let Some(field) = value.get_mut("value") {
                    field.set_value(count).unwrap();
                }
                nt::set_time(&mut value, SystemTime::now()).unwrap();
                counter.update(&value).unwrap();
            },
        }
    }
    // Wait for shutdown, unless another ctrl-c
    select! {
        _ = server.stop() => (),
        _ = tokio::signal::ctrl_c() => println!("Terminating"),
    };
}
