use std::{net::SocketAddr, str::FromStr, thread, time::Duration, time::Instant};

use kadnode::{Contact, Dht, Id, ValueLookup};

use clap::{Parser, Subcommand};

use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:0")]
    address: SocketAddr,
    /// Bootstrap contacts, as `<hex id>@<ip>:<port>`
    #[arg(long)]
    bootstrap: Vec<String>,
    /// Show trace level logs
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node and print its status periodically
    Serve,
    /// Store a value at the closest nodes to its key
    Put { key: String, value: String },
    /// Look up a value
    Get { key: String },
}

fn parse_contact(input: &str) -> Contact {
    let (id, address) = input
        .split_once('@')
        .expect("bootstrap contacts look like <hex id>@<ip>:<port>");

    Contact::new(
        Id::from_str(id).expect("invalid id"),
        address.parse().expect("invalid address"),
    )
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::TRACE } else { Level::INFO })
        .with_thread_names(true)
        .init();

    let bootstrap: Vec<Contact> = cli.bootstrap.iter().map(|s| parse_contact(s)).collect();

    let dht = Dht::builder()
        .address(cli.address)
        .bootstrap(&bootstrap)
        .build()
        .expect("Failed to create DHT node");

    info!(
        "Node running, bootstrap others with --bootstrap {}@{}",
        dht.id(),
        dht.local_contact().address()
    );

    match cli.command {
        Command::Serve => loop {
            thread::sleep(Duration::from_secs(30));
            let info = dht.info();

            info!("=== DHT Node Status ===");
            info!("Node ID: {}", info.id());
            info!("Address: {}", info.address());
            info!("Contacts: {}", info.contacts());
            info!("Inflight requests: {}", info.inflight_requests());
        },
        Command::Put { key, value } => {
            let start = Instant::now();
            let stored = dht.put(&key, value).expect("put failed");

            println!(
                "Stored at {} nodes in {:?} seconds",
                stored.len(),
                start.elapsed().as_secs_f32()
            );
        }
        Command::Get { key } => {
            let start = Instant::now();

            match dht.find_value(&key) {
                ValueLookup::Found { value, from, .. } => {
                    println!("Got {:?} from {}", value, from.address())
                }
                ValueLookup::NotFound(closest) => {
                    println!("Not found, asked {} closest nodes", closest.len())
                }
                ValueLookup::EmptyRoutingTable => println!("No nodes known, pass --bootstrap"),
                ValueLookup::Cancelled => println!("Cancelled"),
            }

            println!("Query took {:?} seconds", start.elapsed().as_secs_f32());
        }
    }
}
