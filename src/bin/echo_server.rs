//! Demo RPC server exposing an `Echo` service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use girder::{Config, MethodError, ReplyClosure, RpcController, RpcService, TcpServer};

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "girder demo RPC server")]
struct Args {
    /// Address to listen on
    #[arg(default_value = "127.0.0.1:12345")]
    addr: String,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

struct EchoService;

impl RpcService for EchoService {
    fn full_name(&self) -> &str {
        "Echo"
    }

    fn call_method(
        &self,
        method: &str,
        controller: RpcController,
        request: &[u8],
        done: ReplyClosure,
    ) -> Result<(), MethodError> {
        match method {
            "say" => {
                let text =
                    std::str::from_utf8(request).map_err(|_| MethodError::Deserialize)?;
                tracing::info!(msg_id = %controller.msg_id(), peer = %controller.peer_addr(), text, "echo");
                done(Ok(text.as_bytes().to_vec()));
                Ok(())
            }
            _ => Err(MethodError::UnknownMethod),
        }
    }
}

fn main() {
    let args = Args::parse();

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

    girder::logging::init(&config);

    if let Err(e) = run(&args.addr, &config) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn run(addr: &str, config: &Config) -> Result<(), girder::Error> {
    let server = TcpServer::new(addr, config)?;
    server.register_service(Arc::new(EchoService));
    server.start()
}
