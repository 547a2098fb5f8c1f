//! TCP echo server on the swivel multi-reactor runtime.

use std::path::PathBuf;

use clap::Parser;
use server::config::{Config, DEFAULT_CONFIG};
use server::{logging, signal};
use swivel::{EventLoop, TcpServer};
use tracing::info;

#[derive(Parser)]
#[command(name = "swivel-echo")]
#[command(about = "TCP echo server on the swivel multi-reactor runtime")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{DEFAULT_CONFIG}");
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr = config.listener.resolve()?;

    let base_loop = EventLoop::new()?;
    let server = TcpServer::new(
        &base_loop,
        listen_addr,
        &config.name,
        config.listener.reuse_port,
    )?;
    server.set_thread_num(config.workers.threads);

    let tcp_nodelay = config.listener.tcp_nodelay;
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            if tcp_nodelay {
                conn.set_tcp_nodelay(true);
            }
            info!(conn = conn.name(), peer = %conn.peer_addr(), "connection up");
        } else {
            info!(conn = conn.name(), "connection down");
        }
    });
    server.set_message_callback(|conn, buf, _receive_time| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });

    signal::install_quit_handler(&base_loop);
    server.start();
    info!(
        address = %server.listen_addr(),
        workers = config.workers.threads,
        "echo server listening"
    );

    base_loop.run();
    Ok(())
}
