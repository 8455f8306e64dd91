#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use chat_relay::codec;
use chat_relay::{Envelope, MessageType, ServerConfig, ServerRuntime, TracingChatLog};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub chat: SocketAddr,
    pub transfer: SocketAddr,
    pub admin: SocketAddr,
    pub ws: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let runtime = ServerRuntime::bind(config, Arc::new(TracingChatLog))
            .await
            .unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        Self {
            chat: runtime.chat_addr(),
            transfer: runtime.transfer_addr(),
            admin: runtime.admin_addr(),
            ws: runtime.ws_addr(),
            stop: Some(stop),
            task: tokio::spawn(runtime.run_until(async {
                let _ = stopped.await;
            })),
        }
    }

    pub async fn start_default() -> Self {
        Self::start(ServerConfig::ephemeral()).await
    }

    /// Resolves once `run_until` has returned
    pub async fn finished(self) {
        let Self { stop, task, .. } = self;
        // Keep the stop sender alive so only an admin shutdown ends the run
        tokio::time::timeout(TIMEOUT * 2, task).await.unwrap().unwrap();
        drop(stop);
    }

    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(TIMEOUT * 2, self.task)
            .await
            .unwrap()
            .unwrap();
    }
}

/// Raw text-socket client speaking the envelope codec
pub struct LineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (read_half, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Connect and log in, asserting the welcome
    pub async fn login(addr: SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&Envelope::new(MessageType::Login, name).with_content(name))
            .await;
        let welcome = client.recv().await.unwrap();
        assert_eq!(welcome.kind, MessageType::Success, "{:?}", welcome);
        client
    }

    pub async fn admin(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&Envelope::new(MessageType::AdminLogin, "admin").with_content("admin:admin123"))
            .await;
        let greeting = client.recv().await.unwrap();
        assert_eq!(greeting.kind, MessageType::AdminAuthSuccess, "{:?}", greeting);
        client
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        codec::write_envelope(&mut self.writer, envelope)
            .await
            .unwrap();
    }

    /// Next envelope, `None` once the server closed the connection
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::time::timeout(TIMEOUT, codec::read_envelope(&mut self.reader, 1 << 20))
            .await
            .expect("timed out waiting for an envelope")
            .ok()
            .flatten()
    }

    /// Skip envelopes until one of `kind` arrives
    pub async fn recv_kind(&mut self, kind: MessageType) -> Envelope {
        loop {
            match self.recv().await {
                Some(envelope) if envelope.kind == kind => return envelope,
                Some(_) => continue,
                None => panic!("connection closed while waiting for {}", kind),
            }
        }
    }

    /// Drain until EOF; returns what arrived on the way
    pub async fn recv_until_closed(&mut self) -> Vec<Envelope> {
        let mut seen = Vec::new();
        while let Some(envelope) = self.recv().await {
            seen.push(envelope);
        }
        seen
    }
}

/// Whether the server closes `stream` without sending anything
pub async fn closed_silently(mut stream: TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}
