use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use wirecall_core::{MemRegistry, Registrar, Server, Service};

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AddArgs {
    #[prost(int32, tag = "1")]
    pub num1: i32,
    #[prost(int32, tag = "2")]
    pub num2: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AddReply {
    #[prost(int32, tag = "1")]
    pub num: i32,
}

#[derive(Parser, Debug)]
#[command(name = "mathserver", about = "Demo arithmetic RPC server for wirecall")]
struct Cli {
    /// Port to listen on (0 for ephemeral)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Suppress request logging
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Serve behind the HTTP CONNECT upgrade instead of plain TCP
    #[arg(long = "http")]
    http: bool,

    /// Advertise under this key in an in-process registry (demo only)
    #[arg(long = "key")]
    key: Option<String>,
}

fn arith() -> wirecall_core::Result<Service> {
    Service::new("Arith")?
        .method("Sum", |args: AddArgs| async move {
            Ok(AddReply {
                num: args.num1 + args.num2,
            })
        })?
        .method("Sleep", |args: AddArgs| async move {
            tokio::time::sleep(Duration::from_secs(args.num1.max(0) as u64)).await;
            Ok(AddReply {
                num: args.num1 + args.num2,
            })
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if !cli.quiet {
        tracing_subscriber::fmt().with_target(false).init();
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", cli.port)).await?;
    let local_addr = listener.local_addr()?;
    println!("Listening on {local_addr}");

    let server = Arc::new(Server::new());
    server.register(arith()?)?;

    if let Some(key) = cli.key {
        let protocol = if cli.http { "http" } else { "tcp" };
        let registry = MemRegistry::new();
        let registrar = Registrar::register(
            registry.handle(),
            &key,
            &format!("{protocol}@{local_addr}"),
            0,
        )
        .await?;
        server.with_registrar(registrar);
    }

    if cli.http {
        server.accept_http(listener).await;
    } else {
        server.accept(listener).await;
    }

    Ok(())
}
