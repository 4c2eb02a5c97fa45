use dltview_wire::{ENGINE_VERSION_HEADER, VersionRange, WireError};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::{Connection, ConnectionStatus, Inbound, SessionConfig, SessionEvent};

/// A connection wired to a live websocket.
pub struct Connected {
    pub conn: Connection,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub transport: TransportHandle,
}

pub struct TransportHandle {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TransportHandle {
    /// Resolves once the engine side went away.
    pub async fn closed(self) {
        let _ = self.reader.await;
        self.writer.abort();
    }

    pub fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Connects to the engine at `url` and starts the reader and writer tasks.
///
/// An engine outside `config.engine_versions` is reported as
/// [`ConnectionStatus::VersionMismatch`]; the connection stays usable.
pub async fn connect(url: &str, config: &SessionConfig) -> Result<Connected, String> {
    let (conn, channels) = Connection::new(config);
    let (ws, response) = match connect_async(url).await {
        Ok(ok) => ok,
        Err(e) => {
            let reason = format!("connect to {url}: {e}");
            conn.set_status(ConnectionStatus::Failed(reason.clone()));
            return Err(reason);
        }
    };
    let version = response
        .headers()
        .get(ENGINE_VERSION_HEADER)
        .and_then(|v| v.to_str().ok());
    let status = version_status(version, config.engine_versions);
    info!(%url, %status, "engine connected");
    conn.set_status(status);

    let (mut write, mut read) = ws.split();
    let mut outgoing = channels.outgoing;
    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!(%e, "websocket send failed");
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    let reader_conn = conn.clone();
    let reader = tokio::spawn(async move {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => reader_conn.handle_inbound(Inbound::Text(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    reader_conn.handle_inbound(Inbound::Binary(bytes))
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "engine closed the connection");
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(%e, "websocket read failed");
                    break Some(e.to_string());
                }
                None => break None,
            }
        };
        reader_conn.handle_inbound(Inbound::Closed(reason));
    });

    Ok(Connected {
        conn,
        events: channels.events,
        transport: TransportHandle { reader, writer },
    })
}

/// Status for the version the engine announced during the upgrade.
pub fn version_status(raw: Option<&str>, required: VersionRange) -> ConnectionStatus {
    let Some(raw) = raw else {
        warn!("engine did not announce its version");
        return ConnectionStatus::Connected {
            engine_version: None,
        };
    };
    match required.check(raw) {
        Ok(version) => ConnectionStatus::Connected {
            engine_version: Some(version),
        },
        Err(WireError::VersionMismatch { actual, required }) => {
            error!(%actual, %required, "unsupported engine version");
            ConnectionStatus::VersionMismatch { actual, required }
        }
        Err(e) => {
            warn!(%e, "ignoring engine version header");
            ConnectionStatus::Connected {
                engine_version: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_ENGINE_VERSIONS;
    use dltview_wire::EngineVersion;

    #[test]
    fn supported_version_connects() {
        assert_eq!(
            version_status(Some("0.62.3"), DEFAULT_ENGINE_VERSIONS),
            ConnectionStatus::Connected {
                engine_version: Some(EngineVersion::new(0, 62, 3))
            }
        );
    }

    #[test]
    fn old_engine_is_a_mismatch_but_usable() {
        let status = version_status(Some("0.50.0"), DEFAULT_ENGINE_VERSIONS);
        assert!(matches!(status, ConnectionStatus::VersionMismatch { .. }));
        assert!(status.is_usable());
    }

    #[test]
    fn missing_or_garbled_header_still_connects() {
        for raw in [None, Some("banana")] {
            assert_eq!(
                version_status(raw, DEFAULT_ENGINE_VERSIONS),
                ConnectionStatus::Connected {
                    engine_version: None
                }
            );
        }
    }
}
