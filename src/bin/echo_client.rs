//! Demo RPC client: sends one `Echo.say` request and prints the reply.

use clap::Parser;
use girder::{Config, EventLoop, RpcMessage, TcpClient};

#[derive(Parser)]
#[command(name = "echo-client")]
#[command(about = "girder demo RPC client")]
struct Args {
    /// Server address
    #[arg(default_value = "127.0.0.1:12345")]
    addr: String,

    /// Message to echo
    #[arg(default_value = "hello from girder")]
    message: String,
}

fn main() {
    let args = Args::parse();
    girder::logging::init(&Config::default());

    if let Err(e) = run(&args) {
        eprintln!("Client error: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), girder::Error> {
    let client = TcpClient::new(&args.addr)?;
    let request = RpcMessage::request("1", "Echo.say", args.message.clone().into_bytes());

    let c = client.clone();
    client.connect(Box::new(move |result| {
        if let Err(e) = result {
            eprintln!("connect failed: {e}");
            c.stop();
            return;
        }
        let on_reply = {
            let c = c.clone();
            Box::new(move |reply: RpcMessage| {
                if reply.is_ok() {
                    println!("reply: {}", String::from_utf8_lossy(&reply.payload));
                } else {
                    eprintln!("rpc error {}: {}", reply.err_code, reply.err_info);
                }
                c.stop();
            })
        };
        c.read_message("1", on_reply);
        c.write_message(request, None);
    }));

    EventLoop::current()?.run();
    Ok(())
}
