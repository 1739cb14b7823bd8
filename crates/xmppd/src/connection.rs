//! Per-connection tasks.
//!
//! Each accepted socket gets a read loop that owns the stream framer
//! and a writer task that drains the session's outbound queue. Stanza
//! handlers run under the server-state lock and never touch the framer
//! or destroy the session directly; they record the
//! `parser_reset_pending` / `teardown_pending` flags, which the read
//! loop consumes after the event that set them has been fully handled.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::parser::{StreamEvent, XmlParser};
use crate::registry::{Outbound, SessionId};
use crate::router;
use crate::server::Server;
use crate::session;
use crate::stream;
use crate::XmppError;

/// Drive one client connection from accept to teardown.
pub async fn handle_connection(server: Arc<Server>, socket: TcpStream, peer: SocketAddr) {
    let (read_half, write_half) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let sid = server.state.lock().await.register(tx, cancel.clone());
    info!(%peer, session = sid, "Client connected");

    let writer = tokio::spawn(write_loop(write_half, rx));

    if let Err(e) = read_loop(&server, sid, read_half, &cancel).await {
        debug!(session = sid, error = %e, "Session failed");
    }

    {
        let mut state = server.state.lock().await;
        session::teardown(&server.config, &mut state, sid);
    }

    // The entry drop closed the queue; the writer flushes what is left
    // and shuts the socket down.
    let _ = writer.await;
    info!(%peer, session = sid, "Client disconnected");
}

/// Drain the outbound queue into the socket, in queue order.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Data(text) => {
                if writer.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
            Outbound::Close(text) => {
                let _ = writer.write_all(text.as_bytes()).await;
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Read bytes, feed the framer, dispatch events, honor deferred flags.
async fn read_loop(
    server: &Server,
    sid: SessionId,
    mut reader: OwnedReadHalf,
    cancel: &CancellationToken,
) -> Result<(), XmppError> {
    let mut parser = XmlParser::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            debug!(session = sid, "Client closed connection");
            return Ok(());
        }
        debug!(target: "xmppd::wire", "<< {}", String::from_utf8_lossy(&buf[..n]));
        parser.feed(&buf[..n]);

        loop {
            let event = match parser.next_event()? {
                Some(ev) => ev,
                None => break,
            };

            let mut state = server.state.lock().await;
            match event {
                StreamEvent::StreamOpened(header) => {
                    stream::handle_stream_open(&server.config, &mut state, sid, &header);
                }
                StreamEvent::Stanza(stanza) => {
                    router::route_stanza(&server.config, &mut state, sid, &stanza);
                }
                StreamEvent::StreamClosed => {
                    stream::handle_stream_close(&mut state, sid);
                }
            }

            // Handlers may not destroy the session mid-dispatch (stream
            // errors, account removal); the request is consumed here,
            // after the dispatch returned.
            let teardown = match state.get(sid) {
                Some(entry) => entry.teardown_pending,
                // Entry already gone: a conflicting bind won.
                None => true,
            };
            drop(state);

            if teardown {
                return Ok(());
            }
        }

        // A SASL success asks for a fresh framer, consumed only after
        // every event of the current chunk has been dispatched: a
        // client may pipeline its bind iq behind `<auth/>` without a
        // stream restart, and those stanzas belong to the old framer.
        let reset_parser = {
            let mut state = server.state.lock().await;
            match state.get_mut(sid) {
                Some(entry) => {
                    let reset = entry.parser_reset_pending;
                    entry.parser_reset_pending = false;
                    reset
                }
                None => false,
            }
        };
        if reset_parser {
            parser.reset();
        }
    }
}
