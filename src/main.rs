use clap::Parser;
use log::{debug, info};
use std::thread;
use std::time::{Duration, Instant};

use alpc_r::ipc::MessageType;
use alpc_r::{ConnectOptions, PortAttributes, PortMessage, Timeout, Transport};

#[derive(Parser)]
#[command(name = "alpc_r")]
#[command(about = "ALPC-style port echo demo", long_about = None)]
struct Cli {
    /// Name of the connection port
    #[arg(short, long, default_value = "\\RPC Control\\alpc_r-echo")]
    name: String,

    /// Request/reply round trips
    #[arg(short, long, default_value_t = 1000)]
    rounds: u32,

    /// Payload bytes per request
    #[arg(short, long, default_value_t = 128)]
    payload: usize,

    /// Per-call timeout in milliseconds
    #[arg(short, long, default_value_t = 2000)]
    timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn serve(listener: alpc_r::Port, capacity: usize, timeout: Timeout) -> alpc_r::Result<u32> {
    let request = listener.receive(capacity, timeout)?;
    let _server = listener
        .accept_connect_port(None, 1, &request, true)?
        .ok_or(alpc_r::AlpcError::ConnectionRefused)?;
    debug!("server: accepted connection {}", request.message_id());

    let mut served = 0;
    loop {
        let message = listener.receive(capacity, timeout)?;
        match message.kind() {
            Some(MessageType::Request) => {
                listener.reply(&message.header, message.data())?;
                served += 1;
            }
            Some(MessageType::PortClosed) => return Ok(served),
            other => debug!("server: ignoring {:?}", other),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let transport = Transport::default();
    let capacity = cli.payload + alpc_r::ipc::PORT_MESSAGE_HEADER_SIZE;
    let attributes = PortAttributes::new().with_max_message_length(capacity.max(0x100));
    let timeout = Timeout::from_millis(cli.timeout);

    let listener = transport.create_port(Some(&cli.name), Some(attributes))?;
    let server = thread::spawn(move || serve(listener, capacity, timeout));

    let (client, _) = transport.connect_port(
        &cli.name,
        ConnectOptions::new()
            .with_attributes(attributes)
            .with_timeout(Duration::from_millis(cli.timeout)),
    )?;
    info!("client: connected to {}", cli.name);

    let payload = vec![0xA5u8; cli.payload];
    let started = Instant::now();
    for round in 0..cli.rounds {
        let mut request = PortMessage::request(&payload)?;
        let reply = client.request(&mut request, capacity, timeout)?;
        if reply.data() != payload.as_slice() {
            return Err(format!("round {}: reply payload mismatch", round).into());
        }
    }
    let elapsed = started.elapsed();
    drop(client);

    let served = server
        .join()
        .map_err(|_| "server thread panicked")??;
    let per_round = elapsed / cli.rounds.max(1);
    println!(
        "{} round trips of {} bytes in {:?} ({:?} per round trip, server answered {})",
        cli.rounds, cli.payload, elapsed, per_round, served
    );
    Ok(())
}
