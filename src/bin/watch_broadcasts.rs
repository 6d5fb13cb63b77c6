use pvars::{
    messages::{Beacon, Command, PvaMessage, RawMessage, Search},
    new_reusable_udp_socket,
    utils::get_default_broadcast_port,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = get_default_broadcast_port();
    let socket = match new_reusable_udp_socket(("0.0.0.0", port)) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Could not listen on UDP port {port}: {e}");
            std::process::exit(1);
        }
    };
    println!("Waiting for packets on 0.0.0.0:{port}");

    let mut buf: Vec<u8> = vec![0; 0xFFFF];
    while let Ok((size, sender)) = socket.recv_from(&mut buf).await {
        let messages = match RawMessage::parse_many(&buf[..size]) {
            Ok(messages) => messages,
            Err(e) => {
                println!("Received {size} byte packet from {sender} that is not PVA: {e}");
                continue;
            }
        };
        for message in messages {
            match message.command() {
                Ok(Command::Beacon) => match Beacon::from_message(&message) {
                    Ok(beacon) => println!(
                        "Received BEACON {} {}:{} (changes: {}) from {sender}",
                        beacon.guid,
                        beacon.server_address.unwrap_or(sender.ip()),
                        beacon.server_port,
                        beacon.change_count,
                    ),
                    Err(e) => println!("Received INVALID beacon from {sender}: {e}"),
                },
                Ok(Command::Search) => match Search::from_message(&message) {
                    Ok(search) => println!(
                        "Received SEARCH for {} names from {sender}: {}",
                        search.channels.len(),
                        search
                            .channels
                            .iter()
                            .map(|(_, name)| name.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    ),
                    Err(e) => println!("Received INVALID search from {sender}: {e}"),
                },
                Ok(other) => println!("Received {other:?} from {sender}"),
                Err(e) => println!("Received unknown message from {sender}: {e}"),
            }
        }
    }
}
