//! Arithmetic service served on two loopback ports and called through XClient
//!
//! Run with `RUST_LOG=debug cargo run --example arith` to see the frames.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xrpc::{MultiServerDiscovery, SelectMode, Server, Service, XClient};

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Arith {
    port: u16,
}

impl Arith {
    async fn sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
        info!(port = self.port, ?args, "Arith.Sum");
        Ok(args.num1 + args.num2)
    }

    async fn sleep(self: Arc<Self>, args: Args) -> Result<i64, String> {
        let secs = u64::try_from(args.num1).map_err(|err| err.to_string())?;
        tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        Ok(args.num1 + args.num2)
    }
}

async fn start_server() -> Result<String, Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let server = Server::new();
    server.register(
        Service::builder(Arith { port })
            .method("Sum", Arith::sum)
            .method("Sleep", Arith::sleep)
            .build()?,
    )?;
    tokio::spawn(Arc::new(server).accept(listener));
    Ok(format!("tcp@127.0.0.1:{port}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let servers = vec![start_server().await?, start_server().await?];
    let xc = XClient::new(
        MultiServerDiscovery::new(servers),
        SelectMode::RoundRobin,
        None,
    );

    for i in 0..5 {
        let sum: i64 = xc.call("Arith.Sum", &Args { num1: i, num2: i * i }).await?;
        println!("call: {i} + {} = {sum}", i * i);
    }

    let mut sum = 0i64;
    xc.broadcast("Arith.Sum", &Args { num1: 7, num2: 8 }, Some(&mut sum))
        .await?;
    println!("broadcast: 7 + 8 = {sum}");

    xc.close().await?;
    Ok(())
}
