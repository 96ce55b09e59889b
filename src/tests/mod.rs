pub(crate) mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::broker::Broker;
use crate::client::WebSocketBrokerClient;
use crate::config::{MessengerKind, Settings};
use crate::message::MessageCodec;
use crate::messenger::{BrokerMessenger, Identity, Messenger, MessengerExt, open_messenger};
use crate::transport::websocket::serve;
use crate::utils::error::BusError;
use fixtures::{BanMessage, MapReload, Punishment, ban, collector, recv_within, registry};

async fn spawn_broker() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Mutex::new(Broker::new()));
    tokio::spawn(serve(listener, broker, 16));
    format!("ws://{addr}")
}

async fn ws_messenger(url: &str, name: &str) -> BrokerMessenger<WebSocketBrokerClient> {
    let client = WebSocketBrokerClient::connect(url, name).await.unwrap();
    BrokerMessenger::new(
        client,
        Identity::new(name).unwrap(),
        MessageCodec::new(registry()),
    )
}

#[tokio::test]
async fn test_messengers_talk_through_websocket_broker() {
    let url = spawn_broker().await;
    let game = ws_messenger(&url, "game-1").await;
    let discord = ws_messenger(&url, "discord").await;

    let (listener, mut rx) = collector::<Punishment>();
    let _sub = discord.subscribe::<Punishment, _>(listener).await.unwrap();
    let (own, mut own_rx) = collector::<BanMessage>();
    let _own = game.subscribe::<BanMessage, _>(own).await.unwrap();

    assert!(game.publish(ban("1.2.3.4"), true).await);
    assert_eq!(
        recv_within(&mut rx, 2000).await,
        Some(Punishment::Ban(ban("1.2.3.4")))
    );
    assert_eq!(own_rx.try_recv().ok(), Some(ban("1.2.3.4")));
    assert_eq!(recv_within(&mut own_rx, 200).await, None);

    game.close().await;
    discord.close().await;
}

#[tokio::test]
async fn test_request_reply_through_websocket_broker() {
    let url = spawn_broker().await;
    let game = ws_messenger(&url, "game-1").await;
    let discord = ws_messenger(&url, "discord").await;

    let _responder = game
        .respond::<BanMessage, MapReload, _, _>(|ban: BanMessage| async move {
            Some(MapReload {
                maps: vec![ban.target],
            })
        })
        .await
        .unwrap();

    let reply = discord
        .request::<BanMessage, MapReload>(ban("griefer"), Duration::from_secs(2))
        .await;
    assert_eq!(
        reply,
        Some(MapReload {
            maps: vec!["griefer".to_string()]
        })
    );

    game.close().await;
    discord.close().await;
}

#[tokio::test]
async fn test_open_messenger_fails_fast_without_broker() {
    let mut settings = Settings::default();
    settings.server.name = "game-1".to_string();
    settings.messenger.kind = MessengerKind::Broker;
    settings.messenger.broker_url = "ws://127.0.0.1:1".to_string();

    let result = open_messenger(&settings, registry()).await;
    assert!(matches!(result, Err(BusError::Broker(_))));
}

#[tokio::test]
async fn test_open_messenger_rejects_bad_identity() {
    let mut settings = Settings::default();
    settings.server.name = "Not Valid".to_string();

    let result = open_messenger(&settings, registry()).await;
    assert!(matches!(result, Err(BusError::Identity(_))));
}

#[tokio::test]
async fn test_polling_messengers_share_a_database_file() {
    let tmp = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.messenger.kind = MessengerKind::Polling;
    settings.messenger.polling.database = tmp.path().join("bus").join("tidings.db");
    settings.messenger.polling.poll_interval_ms = 20;

    settings.server.name = "game-1".to_string();
    let game: Arc<dyn Messenger> = open_messenger(&settings, registry()).await.unwrap();
    settings.server.name = "discord".to_string();
    let discord: Arc<dyn Messenger> = open_messenger(&settings, registry()).await.unwrap();

    let (listener, mut rx) = collector::<Punishment>();
    let _sub = discord.subscribe::<Punishment, _>(listener).await.unwrap();

    assert!(game.publish(ban("1.2.3.4"), false).await);
    assert_eq!(
        recv_within(&mut rx, 3000).await,
        Some(Punishment::Ban(ban("1.2.3.4")))
    );

    game.close().await;
    discord.close().await;
}
