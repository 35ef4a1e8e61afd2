#![cfg(feature = "axum")]

use futures_util::{SinkExt, StreamExt};
use mdsync::protocol::{Message, SyncMessage};
use mdsync::{
    BlobStore, DocumentRegistry, MemoryBlobStore, MemoryDocumentStorage, MemoryMetadataStore, MetadataStore,
    Replica, Services,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::types::xml::{XmlElementPrelim, XmlFragment, XmlTextPrelim};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: std::net::SocketAddr,
    blobs: Arc<MemoryBlobStore>,
    metadata: Arc<MemoryMetadataStore>,
}

async fn serve() -> Server {
    let blobs = Arc::new(MemoryBlobStore::new());
    let metadata = Arc::new(MemoryMetadataStore::new());
    let services = Services::new(
        Arc::new(MemoryDocumentStorage::new()),
        blobs.clone(),
        metadata.clone(),
    );
    let app = mdsync::router(Arc::new(DocumentRegistry::new(services)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        addr,
        blobs,
        metadata,
    }
}

async fn connect(server: &Server, editor_id: &str) -> Client {
    let url = format!("ws://{}/editors/{}/ws", server.addr, editor_id);
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn next_message(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame from server")
            .expect("connection ended")
            .unwrap();
        if let WsMessage::Binary(data) = frame {
            return Message::decode(&data).unwrap();
        }
    }
}

async fn send(client: &mut Client, message: Message) {
    client
        .send(WsMessage::Binary(message.encode()))
        .await
        .unwrap();
}

fn paragraph_update(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let root = doc.get_or_insert_xml_fragment("default");
    {
        let mut txn = doc.transact_mut();
        let paragraph = root.push_back(&mut txn, XmlElementPrelim::empty("paragraph"));
        paragraph.push_back(&mut txn, XmlTextPrelim::new(text));
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

#[tokio::test]
async fn test_two_clients_sync_and_export_on_disconnect() {
    let server = serve().await;
    server.metadata.create_editor("doc-1").await.unwrap();

    let mut first = connect(&server, "doc-1").await;
    assert!(matches!(
        next_message(&mut first).await,
        Message::Sync(SyncMessage::Step1(_))
    ));
    send(
        &mut first,
        Message::Sync(SyncMessage::Update(paragraph_update("hello"))),
    )
    .await;

    let mut second = connect(&server, "doc-1").await;
    send(
        &mut second,
        Message::Sync(SyncMessage::Step1(StateVector::default().encode_v1())),
    )
    .await;

    // the edit arrives either in the step 2 answer or as a relayed update
    let mut view = Replica::new();
    while view.render_markdown() != "hello\n" {
        match next_message(&mut second).await {
            Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                view.apply_update(&update).unwrap();
            }
            _ => {}
        }
    }

    first.close(None).await.unwrap();
    second.close(None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.blobs.contains("markdown/doc-1.md") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("export did not run after the last client left");

    let exported = server.blobs.get("markdown/doc-1.md").await.unwrap();
    assert_eq!(exported, Some(b"hello\n".to_vec()));
}

#[tokio::test]
async fn test_unknown_editor_is_rejected() {
    let server = serve().await;
    let url = format!("ws://{}/editors/missing/ws", server.addr);

    assert!(connect_async(url).await.is_err());
}
