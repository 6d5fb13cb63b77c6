use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pvars::{
    ChannelState, Client, ClientBuilder, ClientError, MonitorEvent, Provider, PvEvent, PvPool,
    ServerBuilder, ServerHandle,
    codec::BitSet,
    data::{PvaData, Structure, nt},
    providers::{PvRegistry, ServerPv},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Create a client and server instance, connected to each other via random port
pub async fn connected_client_server<T>(provider: T) -> (Client, ServerHandle)
where
    T: Provider,
{
    let server = ServerBuilder::new(provider)
        .connection_port(0)
        .search_port(0)
        .beacons(false)
        .start()
        .await
        .unwrap();
    info!(
        "Server ports: {} {}",
        server.connection_port(),
        server.search_port()
    );
    let client = ClientBuilder::new()
        .search_addresses(vec![
            format!("127.0.0.1:{}", server.search_port())
                .parse()
                .unwrap(),
        ])
        .watch_beacons(false)
        .connect_timeout(Duration::from_secs(5))
        .start()
        .await
        .unwrap();
    (client, server)
}

fn demo_value() -> Structure {
    nt::NtScalar::new(3.13)
        .time(UNIX_EPOCH + Duration::from_secs(1000))
        .build()
        .unwrap()
}

/// Commits writes stamped with the time of writing. Negative values also
/// cancel `shutdown`.
fn shutdown_handler(
    shutdown: CancellationToken,
) -> impl Fn(&ServerPv, &BitSet, Structure) -> Result<(), String> + Send + Sync + 'static {
    move |pv: &ServerPv, _: &BitSet, mut proposed: Structure| {
        let value = proposed
            .get("value")
            .and_then(PvaData::as_f64)
            .unwrap_or_default();
        nt::set_time(&mut proposed, SystemTime::now()).map_err(|e| e.to_string())?;
        pv.update(&proposed).map_err(|e| e.to_string())?;
        if value < 0.0 {
            info!("Shutting down after write of {value}");
            shutdown.cancel();
        }
        Ok(())
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> MonitorEvent {
    tokio::time::timeout(Duration::from_secs(4), events.recv())
        .await
        .expect("Did not get subscription event")
        .expect("Subscription ended")
}

fn changed_paths(event: &MonitorEvent) -> Vec<String> {
    event
        .changes
        .iter()
        .filter_map(|index| event.value.path_of_index(index))
        .collect()
}

#[tokio::test]
async fn test_read() {
    init_logging();
    let registry = PvRegistry::new();
    registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;

    let value = client.get("demo").await.unwrap();
    assert_eq!(value.get("value").unwrap().as_f64(), Some(3.13));
    assert_eq!(value.type_name(), "epics:nt/NTScalar:1.0");

    let channel = client.channel("demo");
    let selected = channel.read("field(value,alarm.severity)").await.unwrap();
    assert_eq!(selected.len(), 2);
    assert_eq!(selected.locate("alarm.severity").unwrap().as_i64(), Some(0));
    assert!(selected.locate("alarm.message").is_err());

    let info = channel.info("value").await.unwrap();
    assert_eq!(info.type_name(), "double");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_monitor_demo() {
    init_logging();
    let registry = PvRegistry::new();
    let pv = registry
        .create_pv_with_handler("demo", demo_value(), shutdown_handler(CancellationToken::new()))
        .unwrap();
    let (client, server) = connected_client_server(registry).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = client.channel("demo");
    let _subscription = channel
        .subscribe("", move |event| {
            let _ = events_tx.send(event);
        })
        .unwrap();

    // The first update holds everything
    let first = next_event(&mut events).await;
    assert!(first.changes.get(0));
    assert_eq!(first.value.get("value").unwrap().as_f64(), Some(3.13));

    channel.write("value", 4.13).await.unwrap();
    let update = next_event(&mut events).await;
    assert_eq!(update.value.get("value").unwrap().as_f64(), Some(4.13));
    assert_eq!(update.overrun_count, 0);
    let changed = changed_paths(&update);
    assert!(changed.contains(&"value".to_string()));
    assert!(changed.contains(&"timeStamp.secondsPastEpoch".to_string()));
    assert!(!changed.contains(&"alarm.severity".to_string()));
    assert!(nt::get_time(&update.value).unwrap() > UNIX_EPOCH + Duration::from_secs(1000));

    // Updates from the server side are diffed against what this client last saw
    let mut newer = pv.value();
    newer.locate_mut("alarm.message").unwrap().set_value("HIGH").unwrap();
    pv.update(&newer).unwrap();
    let update = next_event(&mut events).await;
    assert_eq!(changed_paths(&update), vec!["alarm.message".to_string()]);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_negative_write_shuts_down() {
    init_logging();
    let shutdown = CancellationToken::new();
    let registry = PvRegistry::new();
    let pv = registry
        .create_pv_with_handler("demo", demo_value(), shutdown_handler(shutdown.clone()))
        .unwrap();
    let (client, server) = connected_client_server(registry).await;
    let channel = client.channel("demo");

    channel.write("value", 7.0).await.unwrap();
    assert!(!shutdown.is_cancelled());

    let before = SystemTime::now() - Duration::from_secs(1);
    channel.write("value", -1.0).await.unwrap();
    tokio::time::timeout(Duration::from_secs(4), shutdown.cancelled())
        .await
        .expect("Negative write did not signal shutdown");
    // The handler saw and committed the negative value, with a fresh timestamp
    let committed = pv.value();
    assert_eq!(committed.get("value").unwrap().as_f64(), Some(-1.0));
    assert!(nt::get_time(&committed).unwrap() >= before);

    let value = channel.read("").await.unwrap();
    assert_eq!(value.get("value").unwrap().as_f64(), Some(-1.0));
    assert!(nt::get_time(&value).unwrap() >= before);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_write_coerces_to_field_type() {
    init_logging();
    let registry = PvRegistry::new();
    registry
        .create_pv_with_handler(
            "count",
            nt::NtScalar::new(0i32).build().unwrap(),
            |pv: &ServerPv, _: &BitSet, proposed: Structure| {
                pv.update(&proposed).map(|_| ()).map_err(|e| e.to_string())
            },
        )
        .unwrap();
    let (client, server) = connected_client_server(registry).await;
    let channel = client.channel("count");

    channel.write("value", "42").await.unwrap();
    channel.write("alarm.message", 12.5).await.unwrap();
    let value = channel.read("").await.unwrap();
    assert_eq!(value.get("value").unwrap().as_i64(), Some(42));
    assert_eq!(value.locate("alarm.message").unwrap().as_str(), Some("12.5"));

    assert!(matches!(
        channel.write("value", "not a number").await,
        Err(ClientError::Data(_))
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_only() {
    init_logging();
    let registry = PvRegistry::new();
    registry.create_pv("fixed", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;

    match client.put("fixed", 1.0).await {
        Err(ClientError::Server(status)) => assert!(status.message.contains("read-only")),
        other => panic!("Expected a server error, got {other:?}"),
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_pv_times_out() {
    init_logging();
    let (client, server) = connected_client_server(PvRegistry::new()).await;
    let channel = client.channel("missing");
    assert!(matches!(
        channel.connect_within(Duration::from_millis(500)).await,
        Err(ClientError::ConnectTimeout(_))
    ));
    assert_eq!(channel.state(), ChannelState::Searching);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_closed_channel() {
    init_logging();
    let registry = PvRegistry::new();
    registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;
    let channel = client.channel("demo");
    channel.connect().await.unwrap();

    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(
        channel.read("").await,
        Err(ClientError::ChannelClosed)
    ));
    assert!(matches!(
        channel.subscribe("", |_| ()),
        Err(ClientError::ChannelClosed)
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_closes_pv() {
    init_logging();
    let registry = PvRegistry::new();
    let pv = registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = client.channel("demo");
    let _subscription = channel
        .subscribe("value", move |event| {
            let _ = events_tx.send(event);
        })
        .unwrap();
    next_event(&mut events).await;

    let mut state = channel.watch_state();
    pv.close();
    tokio::time::timeout(
        Duration::from_secs(4),
        state.wait_for(|s| *s != ChannelState::Connected),
    )
    .await
    .expect("Channel did not notice the PV closing")
    .unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool() {
    init_logging();
    let registry = PvRegistry::new();
    let server_pv = registry
        .create_pv_with_handler("demo", demo_value(), shutdown_handler(CancellationToken::new()))
        .unwrap();
    let (client, server) = connected_client_server(registry).await;
    let pool = PvPool::new(client);

    let pv = pool.acquire("demo").unwrap();
    let again = pool.acquire("demo").unwrap();
    assert_eq!(pool.references("demo"), 2);
    assert_eq!(again.name(), "demo");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    pv.add_listener(move |event: &PvEvent| {
        let _ = events_tx.send(event.clone());
    });
    let value = loop {
        let event = tokio::time::timeout(Duration::from_secs(4), events.recv())
            .await
            .expect("No value from pooled PV")
            .unwrap();
        if let PvEvent::Value(value) = event {
            break value;
        }
    };
    assert_eq!(value.get("value").unwrap().as_f64(), Some(3.13));
    assert_eq!(again.read().unwrap().get("value").unwrap().as_f64(), Some(3.13));

    again.write(5.5).await.unwrap();
    // A new listener can see the first value twice, so skip to the write
    loop {
        let event = tokio::time::timeout(Duration::from_secs(4), events.recv())
            .await
            .expect("No update from pooled PV")
            .unwrap();
        if let PvEvent::Value(value) = event
            && value.get("value").unwrap().as_f64() == Some(5.5)
        {
            break;
        }
    }
    assert_eq!(server_pv.value().get("value").unwrap().as_f64(), Some(5.5));

    assert_eq!(pool.release(&again).await, 1);
    assert_eq!(pool.release(&pv).await, 0);
    assert_eq!(pool.references("demo"), 0);
    assert_eq!(pv.channel().state(), ChannelState::Closed);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_listener_sees_latest_value() {
    init_logging();
    let registry = PvRegistry::new();
    let pv = registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = client.channel("demo");
    let _subscription = channel
        .subscribe("value", move |event: MonitorEvent| {
            std::thread::sleep(Duration::from_millis(200));
            let _ = events_tx.send(event);
        })
        .unwrap();
    next_event(&mut events).await;

    for count in 1..=20 {
        let mut newer = pv.value();
        newer.get_mut("value").unwrap().set_value(count as f64).unwrap();
        pv.update(&newer).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut overruns = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("Listener never saw the latest value")
            .unwrap();
        overruns += event.overrun_count;
        if event.value.get("value").unwrap().as_f64() == Some(20.0) {
            break;
        }
    }
    assert!(overruns > 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_read() {
    init_logging();
    let registry = PvRegistry::new();
    registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;
    let channel = client.channel("demo");
    channel.connect().await.unwrap();

    // Give up on a read as soon as it has been sent
    tokio::select! {
        biased;
        _ = channel.read("field(alarm)") => (),
        _ = tokio::task::yield_now() => (),
    }
    let value = channel.read("field(value)").await.unwrap();
    assert_eq!(value.len(), 1);
    assert_eq!(value.get("value").unwrap().as_f64(), Some(3.13));

    let value = channel.read("field(alarm.severity)").await.unwrap();
    assert_eq!(value.len(), 1);
    assert_eq!(value.locate("alarm.severity").unwrap().as_i64(), Some(0));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_to_restarted_server() {
    init_logging();
    let registry = PvRegistry::new();
    registry.create_pv("demo", demo_value()).unwrap();
    let (client, server) = connected_client_server(registry).await;
    let connection_port = server.connection_port();
    let search_port = server.search_port();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = client.channel("demo");
    let _subscription = channel
        .subscribe("", move |event| {
            let _ = events_tx.send(event);
        })
        .unwrap();
    let first = next_event(&mut events).await;
    assert_eq!(first.value.get("value").unwrap().as_f64(), Some(3.13));

    let mut state = channel.watch_state();
    server.stop().await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(4),
        state.wait_for(|s| *s == ChannelState::Searching),
    )
    .await
    .expect("Channel did not go back to searching")
    .unwrap();

    // A different shape under the same name. The new server numbers its
    // types from scratch, so nothing from the old connection may be reused.
    let registry = PvRegistry::new();
    registry
        .create_pv(
            "demo",
            nt::NtScalar::new(42i32)
                .description("restarted")
                .build()
                .unwrap(),
        )
        .unwrap();
    let server = ServerBuilder::new(registry)
        .connection_port(connection_port)
        .search_port(search_port)
        .beacons(false)
        .start()
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| *s == ChannelState::Connected),
    )
    .await
    .expect("Channel did not reconnect")
    .unwrap();

    // The subscription resumes, starting with the complete new value
    let resumed = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("Subscription did not resume")
            .unwrap();
        if event.value.get("value").unwrap().as_i64() == Some(42) {
            break event;
        }
    };
    assert!(resumed.changes.get(0));
    assert_eq!(
        resumed.value.get("description").unwrap().as_str(),
        Some("restarted")
    );
    let value = channel.read("").await.unwrap();
    assert_eq!(value.get("value").unwrap().as_i64(), Some(42));
    server.stop().await.unwrap();
}
