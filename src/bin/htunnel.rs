use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use htunnel::config::{ForwardTarget, Mode, TunnelConfig};
use htunnel::{Builder, ExitReason};
use htunnel_core::signaling::{SignalServer, DEFAULT_SIGNAL_SERVER};
use htunnel_core::socket::{Protocol, RemoteAddress};
use htunnel_core::transport::{DirectConfig, DirectTransport};

const EXIT_ADDRESS: u8 = 2;
const EXIT_SIGNALING: u8 = 3;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Signal server address.
    #[arg(
        short,
        long,
        global = true,
        env = "HTUNNEL_SIGNAL_SERVER",
        default_value = DEFAULT_SIGNAL_SERVER
    )]
    signal_server: SocketAddr,
    /// Address offered to peers for the direct transport, may be repeated.
    /// example: --advertise 192.168.1.20
    #[arg(long, global = true)]
    advertise: Vec<IpAddr>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a room and open connections on behalf of clients.
    Server {
        /// Room password.
        #[arg(env = "HTUNNEL_PASSWORD", default_value = "")]
        password: String,
        /// Keep serving connected peers when the signal server goes away.
        #[arg(long)]
        keep_serving: bool,
    },
    /// Forward a local port to an address reachable from the server.
    /// example: htunnel client 8080 10.0.0.5:80 -r 1a2b3c4d
    Client {
        /// Local port or address, `8080` listens on 0.0.0.0:8080.
        localport: String,
        /// Target as seen from the server, `22` means 127.0.0.1:22.
        remote: String,
        /// Room id printed by the server.
        #[arg(short, long)]
        room: String,
        #[arg(short, long, env = "HTUNNEL_PASSWORD", default_value = "")]
        password: String,
        /// Forward UDP instead of TCP.
        #[arg(short, long)]
        udp: bool,
    },
    /// Run a signal server.
    Signal {
        #[arg(short, long, default_value = "0.0.0.0:8888")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{e:?}");
            eprintln!("htunnel: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<u8> {
    let Args {
        signal_server,
        advertise,
        command,
    } = args;
    let config = match command {
        Command::Signal { listen } => {
            serve_signal(listen).await?;
            return Ok(0);
        }
        Command::Server {
            password,
            keep_serving,
        } => TunnelConfig::new(Mode::Server)
            .set_password(password)
            .set_exit_on_signaling_loss(!keep_serving),
        Command::Client {
            localport,
            remote,
            room,
            password,
            udp,
        } => {
            let Some(local_addr) = parse_local(&localport) else {
                eprintln!("htunnel: invalid local address {localport:?}");
                return Ok(EXIT_ADDRESS);
            };
            let Some(remote) = parse_remote(&remote) else {
                eprintln!("htunnel: invalid remote address {remote:?}");
                return Ok(EXIT_ADDRESS);
            };
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };
            TunnelConfig::new(Mode::Client(ForwardTarget {
                local_addr,
                remote,
                protocol,
            }))
            .set_room_id(room)
            .set_password(password)
        }
    };
    let config = config.set_signal_server(signal_server);
    let is_server = config.mode.is_server();
    let transport = DirectTransport::new(DirectConfig::default().set_advertise(advertise));
    let tunnel = match Builder::new(config).transport(transport).build().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            eprintln!("htunnel: cannot start: {e}");
            log::error!("{e:?}");
            return Ok(EXIT_SIGNALING);
        }
    };

    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        if let Err(e) = tx.send(()).await {
            log::warn!("ctrl-c {e:?}");
        }
    })
    .await;

    if is_server {
        tokio::select! {
            room = tunnel.wait_room() => match room {
                Some(room) => println!("room id: {room}"),
                None => log::warn!("stopped before joining a room"),
            },
            _ = quit.recv() => tunnel.shutdown(),
        }
    } else if let Some(addr) = tunnel.local_addr() {
        println!("listening on {addr}");
    }
    let reason = tokio::select! {
        reason = tunnel.wait() => reason,
        _ = quit.recv() => {
            tunnel.shutdown();
            tunnel.wait().await
        }
    };
    match reason {
        ExitReason::Shutdown => Ok(0),
        ExitReason::SignalingFailed(reason) => {
            eprintln!("htunnel: signaling failed: {reason}");
            Ok(EXIT_SIGNALING)
        }
    }
}

async fn serve_signal(listen: SocketAddr) -> anyhow::Result<()> {
    let server = SignalServer::bind(listen).await?;
    log::info!("signal server listening on {}", server.local_addr()?);
    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        if let Err(e) = tx.send(()).await {
            log::warn!("ctrl-c {e:?}");
        }
    })
    .await;
    tokio::select! {
        rs = server.run() => rs?,
        _ = quit.recv() => log::info!("signal server stopped"),
    }
    Ok(())
}

/// `8080` listens on all interfaces.
fn parse_local(s: &str) -> Option<SocketAddr> {
    if let Ok(port) = s.parse::<u16>() {
        return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    s.parse().ok()
}

/// `8080` targets the server machine itself.
fn parse_remote(s: &str) -> Option<RemoteAddress> {
    if let Ok(port) = s.parse::<u16>() {
        if port == 0 {
            return None;
        }
        return Some(RemoteAddress::new(Ipv4Addr::LOCALHOST.to_string(), port));
    }
    s.parse().ok()
}
