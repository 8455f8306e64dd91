mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use chat_relay::transfer::relay::open_stream;
use chat_relay::transfer::{sha256_file, FileOffer, NoProgress, StreamRole, TransferStatus};
use chat_relay::types::FileId;
use chat_relay::{ChatClient, ClientOptions, Envelope, MessageType};
use common::{TestServer, TIMEOUT};

async fn client(
    server: &TestServer,
    name: &str,
    downloads: &Path,
) -> (ChatClient, mpsc::Receiver<Envelope>) {
    let options = ClientOptions {
        download_dir: downloads.to_path_buf(),
        ..ClientOptions::default()
    };
    ChatClient::connect(server.chat, server.transfer, options)
        .await
        .unwrap()
        .login(name)
        .await
        .unwrap()
}

async fn next_of(events: &mut mpsc::Receiver<Envelope>, kind: MessageType) -> Envelope {
    loop {
        let envelope = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("client disconnected");
        if envelope.kind == kind {
            return envelope;
        }
    }
}

fn random_file(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    path
}

/// Offer, accept and stream one file; returns where it landed
async fn transfer(
    alice: &ChatClient,
    alice_events: &mut mpsc::Receiver<Envelope>,
    bob: &ChatClient,
    bob_events: &mut mpsc::Receiver<Envelope>,
    path: &Path,
) -> std::path::PathBuf {
    let file_id = alice.offer_file("bob", path).await.unwrap();

    let request = next_of(bob_events, MessageType::FileTransferRequest).await;
    let offer = FileOffer::from_envelope(&request).unwrap();
    assert_eq!(offer.file_id, file_id);
    assert_eq!(offer.sender, "alice");
    assert!(bob.answer_offer(&offer, &|_: &FileOffer| true).await.unwrap());

    next_of(alice_events, MessageType::FileTransferAccept).await;
    let (sent, received) = tokio::join!(
        alice.send_accepted(file_id, &NoProgress),
        bob.receive_accepted(file_id, &NoProgress),
    );
    sent.unwrap();
    let landed = received.unwrap();

    // The sender hears that the receiver verified the file
    let complete = next_of(alice_events, MessageType::FileComplete).await;
    assert_eq!(complete.file_id, Some(file_id));
    assert_eq!(complete.sender, "bob");
    assert_eq!(alice.transfer_status(file_id), None);
    landed
}

#[tokio::test]
async fn test_file_relay_with_collision_safe_names() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();

    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "report.pdf", 200_000);

    let first = transfer(&alice, &mut alice_events, &bob, &mut bob_events, &source).await;
    assert_eq!(first, downloads.path().join("bob").join("report.pdf"));
    assert_eq!(
        sha256_file(&first).await.unwrap(),
        sha256_file(&source).await.unwrap()
    );

    let second = transfer(&alice, &mut alice_events, &bob, &mut bob_events, &source).await;
    assert_eq!(second, downloads.path().join("bob").join("report_(1).pdf"));
    assert_eq!(std::fs::metadata(&second).unwrap().len(), 200_000);
    // The first copy was not overwritten
    assert_eq!(std::fs::metadata(&first).unwrap().len(), 200_000);

    server.stop().await;
}

#[tokio::test]
async fn test_empty_file_transfer() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "empty.txt", 0);
    let landed = transfer(&alice, &mut alice_events, &bob, &mut bob_events, &source).await;
    assert_eq!(std::fs::metadata(&landed).unwrap().len(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_progress_reaches_one_hundred() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "photo.jpg", 50_000);
    let file_id = alice.offer_file("bob", &source).await.unwrap();
    let request = next_of(&mut bob_events, MessageType::FileTransferRequest).await;
    let offer = FileOffer::from_envelope(&request).unwrap();
    bob.answer_offer(&offer, &|_: &FileOffer| true).await.unwrap();
    next_of(&mut alice_events, MessageType::FileTransferAccept).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = {
        let seen = seen.clone();
        move |_: FileId, percent: u8, _: u64, _: u64| seen.lock().unwrap().push(percent)
    };
    let (sent, received) = tokio::join!(
        alice.send_accepted(file_id, &NoProgress),
        bob.receive_accepted(file_id, &record),
    );
    sent.unwrap();
    received.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    server.stop().await;
}

#[tokio::test]
async fn test_receiver_check_failure_reaches_sender() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "ledger.csv", 3);
    let file_id = alice.offer_file("bob", &source).await.unwrap();
    let request = next_of(&mut bob_events, MessageType::FileTransferRequest).await;
    let offer = FileOffer::from_envelope(&request).unwrap();
    bob.answer_offer(&offer, &|_: &FileOffer| true).await.unwrap();
    next_of(&mut alice_events, MessageType::FileTransferAccept).await;

    // bob takes every byte off the relay, then reports a failed length check
    let drain = async {
        let mut stream = open_stream(server.transfer, "bob", file_id, StreamRole::Receive, 16 * 1024)
            .await
            .unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        bytes
    };
    let (sent, bytes) = tokio::join!(alice.send_accepted(file_id, &NoProgress), drain);
    sent.unwrap();
    assert_eq!(bytes.len(), 8 + 3);
    assert_eq!(alice.transfer_status(file_id), Some(TransferStatus::InProgress));

    bob.send(
        Envelope::new(MessageType::FileError, "bob")
            .to("alice")
            .with_content("file on disk is 2 bytes, expected 3")
            .with_file_id(file_id),
    )
    .await
    .unwrap();
    let error = next_of(&mut alice_events, MessageType::FileError).await;
    assert_eq!(error.file_id, Some(file_id));
    assert_eq!(error.sender, "bob");
    assert_eq!(error.content_str(), "file on disk is 2 bytes, expected 3");
    assert_eq!(alice.transfer_status(file_id), None);

    server.stop().await;
}

#[tokio::test]
async fn test_rejected_offer_reaches_sender() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "virus.exe", 10);
    let file_id = alice.offer_file("bob", &source).await.unwrap();
    let request = next_of(&mut bob_events, MessageType::FileTransferRequest).await;
    let offer = FileOffer::from_envelope(&request).unwrap();
    assert!(!bob.answer_offer(&offer, &|_: &FileOffer| false).await.unwrap());

    let reject = next_of(&mut alice_events, MessageType::FileTransferReject).await;
    assert_eq!(reject.file_id, Some(file_id));
    assert!(!downloads.path().join("bob").join("virus.exe").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_offer_to_offline_user_fails() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;

    let source = random_file(outbox.path(), "notes.txt", 10);
    let file_id = alice.offer_file("ghost", &source).await.unwrap();
    let error = next_of(&mut alice_events, MessageType::FileError).await;
    assert_eq!(error.file_id, Some(file_id));

    server.stop().await;
}

#[tokio::test]
async fn test_receiver_departure_fails_the_transfer() {
    let server = TestServer::start_default().await;
    let outbox = tempfile::tempdir().unwrap();
    let downloads = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = client(&server, "alice", outbox.path()).await;
    let (bob, mut bob_events) = client(&server, "bob", downloads.path()).await;

    let source = random_file(outbox.path(), "draft.doc", 10);
    let file_id = alice.offer_file("bob", &source).await.unwrap();
    next_of(&mut bob_events, MessageType::FileTransferRequest).await;
    bob.logout().await.unwrap();

    let error = next_of(&mut alice_events, MessageType::FileError).await;
    assert_eq!(error.file_id, Some(file_id));

    server.stop().await;
}
