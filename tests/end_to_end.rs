use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use xrpc::protocol::snapshot;
use xrpc::{Call, Client, Error, Options, Server, Service, x_dial};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Args {
    num1: i64,
    num2: i64,
}

struct Arith;

impl Arith {
    async fn sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
        Ok(args.num1 + args.num2)
    }

    async fn div(self: Arc<Self>, args: Args) -> Result<i64, String> {
        if args.num2 == 0 {
            return Err("divide by zero".to_string());
        }
        Ok(args.num1 / args.num2)
    }

    async fn sleep_sum(self: Arc<Self>, args: Args) -> Result<i64, String> {
        // Larger first operands finish sooner.
        let delay = u64::try_from(50 - args.num1.clamp(0, 50)).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(args.num1 + args.num2)
    }
}

async fn start_server() -> (Arc<Server>, String) {
    let server = Arc::new(Server::new());
    let service = Service::builder(Arith)
        .method("Sum", Arith::sum)
        .method("Div", Arith::div)
        .method("SleepSum", Arith::sleep_sum)
        .build()
        .unwrap();
    server.register(service).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::clone(&server).accept(listener));
    (server, addr)
}

#[tokio::test]
async fn sum_over_tcp() {
    let (server, addr) = start_server().await;
    let client = Client::dial("tcp", &addr, None).await.unwrap();

    let reply: i64 = client
        .call("Arith.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);

    let sum = Arc::clone(server.service("Arith").unwrap().method("Sum").unwrap());
    assert_eq!(sum.num_calls(), 1);
    assert!(snapshot().calls_sent >= 1);
}

#[tokio::test]
async fn errors_do_not_break_the_connection() {
    let (_server, addr) = start_server().await;
    let client = x_dial(&format!("tcp@{addr}"), Some(Options::default()))
        .await
        .unwrap();

    let err = client
        .call::<_, i64>("Foo.Missing", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ref msg) if msg.contains("can't find service Foo")));

    let err = client
        .call::<_, i64>("Arith.Div", &Args { num1: 1, num2: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ref msg) if msg == "divide by zero"));

    let reply: i64 = client
        .call("Arith.Div", &Args { num1: 9, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 3);
}

#[tokio::test]
async fn concurrent_calls_on_one_connection() {
    let (_server, addr) = start_server().await;
    let client = Arc::new(Client::dial("tcp", &addr, None).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..20 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let reply: i64 = client
                .call("Arith.SleepSum", &Args { num1: i, num2: i * i })
                .await
                .unwrap();
            (i, reply)
        }));
    }

    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply, i + i * i);
    }
}

#[tokio::test]
async fn shared_completion_queue() {
    let (_server, addr) = start_server().await;
    let client = Client::dial("tcp", &addr, None).await.unwrap();
    let (tx, mut rx) = mpsc::channel::<Call<i64>>(4);

    for i in 0..10 {
        client
            .go("Arith.SleepSum", &Args { num1: i * 5, num2: 1 }, tx.clone())
            .await;
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Some(call) = rx.recv().await {
        let seq = i64::try_from(call.seq).unwrap();
        assert_eq!(call.into_result().unwrap(), (seq - 1) * 5 + 1);
        seen.push(seq);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn close_then_call_fails() {
    let (_server, addr) = start_server().await;
    let client = Client::dial("tcp", &addr, None).await.unwrap();

    client.close().await.unwrap();
    assert!(!client.is_available());
    let err = client
        .call::<_, i64>("Arith.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));
    assert!(matches!(client.close().await, Err(Error::Shutdown)));
}

#[tokio::test]
async fn dial_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    assert!(matches!(
        Client::dial("tcp", &addr, None).await,
        Err(Error::Io(_))
    ));
}
