use clap::Parser;
use shared::{read_packet, write_packet, Packet, DEFAULT_VIEWER_PORT};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Headless viewer for poking at a running relay
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Relay viewer address
    #[clap(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_VIEWER_PORT))]
    addr: String,
    /// Request this frame index after connecting
    #[clap(long, allow_hyphen_values = true)]
    seek: Option<i64>,
    /// Pause playback after connecting
    #[clap(long)]
    pause: bool,
    /// Resume playback after connecting
    #[clap(long)]
    resume: bool,
    /// Stop after this many packets
    #[clap(short, long, default_value_t = 10)]
    count: usize,
    /// Give up if nothing arrives for this many seconds
    #[clap(long, default_value_t = 5)]
    idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.addr);
    let mut stream = TcpStream::connect(&args.addr).await?;
    println!("Connected from {}", stream.local_addr()?);

    if args.pause {
        println!("Sending pause");
        write_packet(&mut stream, &Packet::Pause).await?;
    }
    if args.resume {
        println!("Sending resume");
        write_packet(&mut stream, &Packet::Resume).await?;
    }
    if let Some(index) = args.seek {
        println!("Requesting frame {}", index);
        write_packet(&mut stream, &Packet::RequestFrame { index }).await?;
    }

    let idle = Duration::from_secs(args.idle_secs);
    for _ in 0..args.count {
        let packet = match timeout(idle, read_packet(&mut stream)).await {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => {
                println!("Server closed the connection");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                println!("No packet within {}s", args.idle_secs);
                break;
            }
        };

        match packet {
            Packet::Frame(update) => {
                println!(
                    "Frame {}/{} with {} agents",
                    update.frame_index,
                    update.total_frames,
                    update.agents.len()
                );
                for agent in update.agents.iter().take(5) {
                    println!("  Agent {}: ({:.3}, {:.3})", agent.id, agent.x, agent.y);
                }
            }
            Packet::Playback(status) => println!(
                "Playback paused={} current={} total={}",
                status.is_paused, status.current_frame, status.total_frames
            ),
            Packet::Settings(settings) => println!("Settings: {:?}", settings),
            Packet::Error { reason } => println!("Server error: {}", reason),
            other => println!("Unexpected packet: {:?}", other),
        }
    }

    println!("Sending disconnect");
    write_packet(&mut stream, &Packet::Disconnect).await?;
    println!("Viewer probe finished");
    Ok(())
}
