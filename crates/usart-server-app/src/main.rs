//! `usart-server`: run the USART test partner on a host serial port

use std::io::{self, BufRead};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use usart_server_core::driver::serial::{list_ports, SerialPortDriver};
use usart_server_core::driver::NoAuxSignals;
use usart_server_core::server::{detect_capabilities, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "usart-server",
    version,
    about = "Command/response partner for USART driver validation"
)]
struct Args {
    /// Serial port to serve on (e.g. /dev/ttyUSB0 or COM3)
    port: Option<String>,

    /// List available serial ports and exit
    #[arg(short, long)]
    list: bool,

    /// Probe the port's capabilities, print them as JSON and exit
    #[arg(short, long)]
    probe: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  [{:04x}:{:04x}] {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list {
        print_ports();
        return Ok(());
    }

    let Some(port) = args.port else {
        bail!("no serial port given (use --list to see available ports)");
    };
    let config = ServerConfig::default();

    if args.probe {
        let snapshot = detect_capabilities(SerialPortDriver::new(&port), NoAuxSignals, &config)
            .with_context(|| format!("probing {}", port))?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        println!("{}", snapshot.to_record());
        return Ok(());
    }

    let server = Server::start(SerialPortDriver::new(&port), NoAuxSignals, config)
        .with_context(|| format!("starting server on {}", port))?;
    info!("Serving on {}, press Enter to stop", port);

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;

    server.stop().context("stopping server")?;
    info!("Server stopped");
    Ok(())
}
