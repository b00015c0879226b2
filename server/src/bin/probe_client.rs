//! Manual probe for a running realm server.
//!
//! Optionally deposits a handoff as the login center would (the probe must
//! then run from the trusted center address), then connects as a player,
//! completes the handshake, walks a little, chats and prints everything the
//! server sends back.

use clap::Parser;
use realm_shared::{read_frame, write_frame, Packet, DEFAULT_PORT, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    server: SocketAddr,
    /// Login id to claim; random if omitted
    #[clap(short, long)]
    login_id: Option<u32>,
    /// Character name to deposit
    #[clap(short, long, default_value = "Probe")]
    name: String,
    /// Skip the center deposit and only try to claim
    #[clap(long)]
    no_deposit: bool,
    /// Seconds to keep listening after the scripted actions
    #[clap(short, long, default_value = "3")]
    wait: u64,
}

// Get current timestamp in milliseconds
fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let login_id = args.login_id.unwrap_or_else(rand::random);
    let auth_token: Vec<u8> = (0..16).map(|_| rand::random::<u8>()).collect();

    if !args.no_deposit {
        let mut center = TcpStream::connect(args.server).await?;
        write_frame(
            &mut center,
            &Packet::DepositHandoff {
                login_id,
                account: format!("probe-{}", login_id),
                character_name: args.name.clone(),
                auth_token: auth_token.clone(),
            },
        )
        .await?;
        write_frame(&mut center, &Packet::Disconnect).await?;
        println!("Deposited handoff for login {}", login_id);
        // Give the server a moment to process the deposit before claiming it.
        sleep(Duration::from_millis(100)).await;
    }

    let stream = TcpStream::connect(args.server).await?;
    println!("Connected to {} from {}", args.server, stream.local_addr()?);
    let (mut reader, mut writer) = stream.into_split();

    let listener = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some((packet, len))) => {
                    if let Packet::Pong { timestamp } = packet {
                        println!("Pong after {} ms", get_timestamp().saturating_sub(timestamp));
                    } else {
                        println!("<- {:?} ({} bytes)", packet, len);
                    }
                }
                Ok(None) => {
                    println!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    println!("Read error: {}", e);
                    break;
                }
            }
        }
    });

    let script = [
        Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            login_id,
            auth_token,
        },
        Packet::Ping {
            timestamp: get_timestamp(),
        },
        Packet::Move { dx: 1.0, dy: 0.0 },
        Packet::Chat {
            text: format!("hello from {}", args.name),
        },
        Packet::Move { dx: 0.0, dy: 0.0 },
    ];
    for packet in &script {
        println!("-> {:?}", packet);
        write_frame(&mut writer, packet).await?;
        sleep(Duration::from_millis(250)).await;
    }

    sleep(Duration::from_secs(args.wait)).await;
    write_frame(&mut writer, &Packet::Disconnect).await?;
    let _ = timeout(Duration::from_secs(1), listener).await;
    Ok(())
}
