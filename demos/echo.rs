//! Echo over virtual streams
//!
//! Run with: cargo run --example echo [CLIENTS]
//!
//! Two registries share an in-memory link. The server listens on the `echo`
//! protocol and only admits clients whose handshake names them; the client
//! side opens several streams, one of them with a bad name.
//!
//! ```text
//!   client registry                         server registry
//!   ┌──────────────┐   MemoryMux::pair()   ┌──────────────┐
//!   │ connect()    │◄─────────────────────►│ listen()     │
//!   │  "client-N"  │                       │ on_handshake │
//!   └──────────────┘                       └──────┬───────┘
//!                                                 │ next_connection()
//!                                                 ▼
//!                                            echo task per stream
//! ```

use std::sync::Arc;

use protoplex_rs::codec::Utf8;
use protoplex_rs::mux::MemoryMux;
use protoplex_rs::{StreamEvent, StreamOptions, StreamRegistry};

type EchoRegistry = StreamRegistry<MemoryMux, Utf8, Utf8>;

fn options() -> StreamOptions<Utf8, Utf8> {
    StreamOptions::new().protocol("echo")
}

async fn serve(server: Arc<EchoRegistry>) {
    while let Some(stream) = server.next_connection().await {
        tokio::spawn(async move {
            if let Err(e) = stream.opened().await {
                println!("[server] refused stream: {}", e);
                return;
            }
            let who = stream.remote_handshake().unwrap_or_default();

            loop {
                match stream.read().await {
                    Ok(Some(line)) => {
                        println!("[server] {} says {:?}", who, line);
                        if stream.write_one(line.to_uppercase()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        println!("[server] {} failed: {}", who, e);
                        return;
                    }
                }
            }

            let _ = stream.close().await;
            println!("[server] {} done", who);
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let clients: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 3,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("protoplex_rs=debug".parse()?)
                .add_directive("echo=debug".parse()?),
        )
        .init();

    let (a, b) = MemoryMux::pair();
    let client = EchoRegistry::new(a, StreamOptions::new())?;
    let server = Arc::new(EchoRegistry::new(b, StreamOptions::new())?);

    server.listen(
        None,
        options().handshake("echo-server".to_string()).on_handshake(
            |name: String| async move { Ok(name.starts_with("client-")) },
        ),
    )?;
    tokio::spawn(serve(Arc::clone(&server)));

    let mut names: Vec<String> = (0..clients).map(|i| format!("client-{}", i)).collect();
    names.push("intruder".to_string());

    let mut tasks = Vec::new();
    for name in names {
        let stream = client.connect(None, options().handshake(name.clone()))?;
        let mut events = stream.subscribe();

        tasks.push(tokio::spawn(async move {
            if stream
                .write(vec!["hello".to_string(), format!("from {}", name)])
                .await
                .is_err()
            {
                println!("[{}] write refused", name);
            }
            let _ = stream.close().await;

            while let Ok(Some(reply)) = stream.read().await {
                println!("[{}] got {:?}", name, reply);
            }
            stream.closed().await;

            while let Ok(event) = events.try_recv() {
                if let StreamEvent::Reject(cause) | StreamEvent::Error(cause) = event {
                    println!("[{}] {}", name, cause);
                }
            }
        }));
    }

    for task in tasks {
        task.await?;
    }

    println!("Live server streams: {}", server.stream_count());
    Ok(())
}
