use super::connection::Client;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    assert!(client.id.starts_with("client-"));
    assert!(client.consumer_tags().is_empty());
}

#[tokio::test]
async fn cancel_consumer_aborts_forwarder() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    let forwarder = tokio::spawn(std::future::pending::<()>());
    client.add_consumer("ctag-1".to_string(), forwarder);
    assert_eq!(client.consumer_tags(), vec!["ctag-1".to_string()]);

    assert!(client.cancel_consumer("ctag-1"));
    assert!(!client.cancel_consumer("ctag-1"));
    assert!(client.consumer_tags().is_empty());
}

#[tokio::test]
async fn cancel_all_reports_count() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);
    client.add_consumer("a".into(), tokio::spawn(std::future::pending::<()>()));
    client.add_consumer("b".into(), tokio::spawn(std::future::pending::<()>()));
    assert_eq!(client.cancel_all(), 2);
    assert_eq!(client.cancel_all(), 0);
}
