//! Test utilities: an ephemeral server over a throwaway data directory
//! and a raw XML client for driving the protocol directly.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use xmppd::config::LogLevel;
use xmppd::{Config, Server};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The domain every test server serves.
pub const TEST_DOMAIN: &str = "example.org";

/// An xmppd instance on an ephemeral port with a temporary data dir.
pub struct TestServer {
    pub addr: SocketAddr,
    pub datadir: PathBuf,
    pub shutdown: CancellationToken,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    /// Start a server for `example.org` on an ephemeral port.
    pub async fn start() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let datadir = tempdir.path().join("data");
        std::fs::create_dir_all(&datadir).expect("datadir");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let config = Config {
            domain: TEST_DOMAIN.to_string(),
            port: addr.port(),
            bind_address: "127.0.0.1".to_string(),
            datadir: datadir.clone(),
            logfile: tempdir.path().join("xmppd.log"),
            loglevel: LogLevel::Info,
        };

        let shutdown = CancellationToken::new();
        let server = Server::new(config);
        tokio::spawn(server.run(listener, shutdown.clone()));

        Self {
            addr,
            datadir,
            shutdown,
            _tempdir: tempdir,
        }
    }

    /// Create an account directly in the data directory.
    pub fn add_user(&self, username: &str, password: &str) {
        xmppd::user::create_user(&self.datadir, username, password).expect("create user");
    }
}

/// A test client speaking raw XML over TCP.
pub struct RawXmppClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl RawXmppClient {
    /// Connect to a test server.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    /// Write raw protocol text.
    pub async fn send(&mut self, text: &str) {
        timeout(DEFAULT_TIMEOUT, self.stream.write_all(text.as_bytes()))
            .await
            .expect("write timed out")
            .expect("write failed");
    }

    /// Read until the accumulated data contains `needle`, then return
    /// and clear everything read so far. Panics on timeout or close.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let mut buf = [0u8; 4096];
        loop {
            let text = String::from_utf8_lossy(&self.pending);
            if text.contains(needle) {
                let out = text.into_owned();
                self.pending.clear();
                return out;
            }
            let n = timeout(DEFAULT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", needle))
                .expect("read failed");
            if n == 0 {
                panic!(
                    "connection closed while waiting for {:?}; buffered: {}",
                    needle,
                    String::from_utf8_lossy(&self.pending)
                );
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Wait for the server to close the connection. A reset counts as
    /// closed.
    pub async fn read_eof(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match timeout(DEFAULT_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for close")
            {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    /// Open an XML stream and return the server's features.
    pub async fn open_stream(&mut self) -> String {
        self.send(&format!(
            "<?xml version='1.0'?>\
             <stream:stream to='{}' xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
            TEST_DOMAIN
        ))
        .await;
        self.read_until("</stream:features>").await
    }

    /// Authenticate with SASL PLAIN and return the server's reply.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> String {
        let payload = BASE64_STANDARD.encode(format!("\0{}\0{}", username, password));
        self.send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            payload
        ))
        .await;
        self.read_until("xmpp-sasl").await
    }

    /// Bind a resource and return the server's reply.
    pub async fn bind(&mut self, resource: &str) -> String {
        self.send(&format!(
            "<iq type='set' id='bind-1'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{}</resource></bind></iq>",
            resource
        ))
        .await;
        self.read_until("</iq>").await
    }
}

/// Open, authenticate, restart the stream, and bind a resource.
pub async fn establish_bound_session(
    client: &mut RawXmppClient,
    username: &str,
    password: &str,
    resource: &str,
) {
    let features = client.open_stream().await;
    assert!(
        features.contains("PLAIN"),
        "expected PLAIN mechanism, got: {}",
        features
    );

    let reply = client.authenticate(username, password).await;
    assert!(reply.contains("<success"), "auth failed: {}", reply);

    let features = client.open_stream().await;
    assert!(
        features.contains("xmpp-bind"),
        "expected bind feature, got: {}",
        features
    );

    let reply = client.bind(resource).await;
    assert!(
        reply.contains(&format!("{}@{}/{}", username, TEST_DOMAIN, resource)),
        "bind failed: {}",
        reply
    );
}
