//! Book Service - unary and streaming calls over a WebSocket.
//!
//! This example demonstrates:
//! - Serving a module on every port a client opens
//! - Typed prost procedures, one unary and one streaming
//! - Consuming a stream with ack-paced delivery
//!
//! # Running
//!
//! ```sh
//! RUST_LOG=portrpc=debug cargo run --example book_service
//! ```

use futures::StreamExt;
use portrpc::transport::websocket;
use portrpc::{ModuleDefinition, RpcClient, RpcServer, RpcServerPort};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Clone, PartialEq, prost::Message)]
struct Book {
    #[prost(string, tag = "1")]
    author: String,
    #[prost(int64, tag = "2")]
    isbn: i64,
    #[prost(string, tag = "3")]
    title: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct GetBookRequest {
    #[prost(int64, tag = "1")]
    isbn: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
struct QueryBooksRequest {
    #[prost(string, tag = "1")]
    author_prefix: String,
}

/// Per-connection state handed to every procedure.
#[derive(Clone)]
struct Catalogue {
    books: Vec<Book>,
}

fn catalogue() -> Catalogue {
    let book = |author: &str, isbn, title: &str| Book {
        author: author.to_string(),
        isbn,
        title: title.to_string(),
    };
    Catalogue {
        books: vec![
            book("mr menduz", 1234, "1001 reasons to write your own OS"),
            book("mr cazala", 1111, "Advanced CSS"),
            book("mr mannakia", 7666, "Advanced binary packing"),
            book("mr kuruk", 7668, "Advanced bots AI"),
        ],
    }
}

fn book_service() -> ModuleDefinition<Catalogue> {
    ModuleDefinition::new()
        .unary("getBook", |req: GetBookRequest, catalogue: Catalogue| async move {
            catalogue
                .books
                .into_iter()
                .find(|b| b.isbn == req.isbn)
                .ok_or_else(|| portrpc::RpcError::procedure(format!("no book {}", req.isbn)))
        })
        .stream("queryBooks", |req: QueryBooksRequest, catalogue: Catalogue| {
            futures::stream::iter(
                catalogue
                    .books
                    .into_iter()
                    .filter(move |b| b.author.starts_with(&req.author_prefix))
                    .map(Ok),
            )
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = RpcServer::builder()
        .handler(|port: RpcServerPort<Catalogue>, _transport, _ctx| async move {
            port.register_module("BookService", |_| async { Ok(book_service()) })
        })
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            match websocket::accept(socket).await {
                Ok(transport) => {
                    tracing::info!("Client connected from {}", peer);
                    server.attach_transport(transport, catalogue());
                }
                Err(e) => tracing::warn!("Handshake with {} failed: {}", peer, e),
            }
        }
    });

    let client = RpcClient::new(websocket::connect(&format!("ws://{addr}")).await?);
    let port = client.create_port("my-port").await?;
    let books = port.load_module("BookService").await?;
    println!("Loaded {} with {:?}", books.name(), books.procedures());

    let book: Book = books.unary("getBook", &GetBookRequest { isbn: 7666 }).await?;
    println!("getBook -> {book:?}");

    let mut results = books
        .stream::<_, Book>(
            "queryBooks",
            &QueryBooksRequest {
                author_prefix: "mr".to_string(),
            },
        )
        .await?;
    while let Some(book) = results.next().await {
        println!("queryBooks -> {:?}", book?);
    }

    port.close().await?;
    client.close();
    Ok(())
}
