use std::sync::Arc;

use dltview_types::{Lifecycle, Record, StreamId};
use dltview_wire::{BinFrame, Command, WireLifecycle, decode_bin_frame_default};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::{
    ConnectionStatus, DispatchOutcome, EarlyDataLimits, LifecycleTable, RpcCorrelator, RpcError,
    SessionConfig, SessionError, SessionEvent, SessionMetadata, StreamRegistry, StreamSink,
};

/// One message received from the engine.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The transport went away, with the reason if it was not a clean close.
    Closed(Option<String>),
}

/// Receiving ends handed out when a connection is created.
pub struct ConnectionChannels {
    /// Encoded commands, in send order. Drained by the transport writer.
    pub outgoing: mpsc::UnboundedReceiver<String>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Client side of the single duplex link to the engine.
///
/// Cheap to clone; all clones share the same correlator, registry and
/// metadata. The transport feeds it through [`Connection::handle_inbound`].
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    correlator: Mutex<RpcCorrelator>,
    // Lock order: lifecycles before registry.
    lifecycles: RwLock<LifecycleTable>,
    registry: Mutex<StreamRegistry>,
    metadata: Mutex<SessionMetadata>,
    outgoing: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<ConnectionStatus>,
    lifecycle_revision: watch::Sender<u64>,
}

impl Connection {
    pub fn new(config: &SessionConfig) -> (Self, ConnectionChannels) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (lifecycle_revision, _) = watch::channel(0);
        let limits = EarlyDataLimits {
            warn_batches: config.early_data_warn_batches,
            max_batches: config.early_data_max_batches,
            max_bytes: config.early_data_max_bytes,
        };
        let shared = Shared {
            correlator: Mutex::new(RpcCorrelator::new()),
            lifecycles: RwLock::new(LifecycleTable::new()),
            registry: Mutex::new(StreamRegistry::new(limits)),
            metadata: Mutex::new(SessionMetadata::default()),
            outgoing: outgoing_tx,
            events: events_tx,
            status,
            lifecycle_revision,
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            ConnectionChannels {
                outgoing: outgoing_rx,
                events: events_rx,
            },
        )
    }

    /// A connection without a transport: the caller reads commands from
    /// `outgoing` and answers through [`Connection::handle_inbound`].
    pub fn detached(config: &SessionConfig) -> (Self, ConnectionChannels) {
        let (conn, channels) = Self::new(config);
        conn.set_status(ConnectionStatus::Connected {
            engine_version: None,
        });
        (conn, channels)
    }

    pub async fn send(&self, command: &Command) -> Result<String, SessionError> {
        let text = command.encode()?;
        Ok(self.send_text(command.name(), text).await?)
    }

    /// Sends `text` and waits for the reply paired with it.
    ///
    /// The completion slot is queued under the same lock that hands the text
    /// to the transport, so queue order always equals send order.
    pub async fn send_text(&self, command: &'static str, text: String) -> Result<String, RpcError> {
        let rx = {
            let mut correlator = self.shared.correlator.lock();
            let (seq, rx) = correlator.enqueue(command)?;
            debug!(seq = %seq, command, "sending request");
            if self.shared.outgoing.send(text).is_err() {
                warn!(seq = %seq, command, "transport writer is gone");
                correlator.fail(seq, RpcError::SendFailed { command });
            }
            rx
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::TransportClosed { command }),
        }
    }

    pub fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Text(reply) => {
                self.shared.correlator.lock().resolve(reply);
            }
            Inbound::Binary(bytes) => match decode_bin_frame_default(&bytes) {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => {
                    warn!(%e, len = bytes.len(), "dropping undecodable frame");
                    self.emit(SessionEvent::Warning(format!("undecodable frame: {e}")));
                }
            },
            Inbound::Closed(None) => self.close(ConnectionStatus::Closed),
            Inbound::Closed(Some(reason)) => self.close(ConnectionStatus::Failed(reason)),
        }
    }

    pub fn handle_frame(&self, frame: BinFrame) {
        match frame {
            BinFrame::DltMsgs(batch) => {
                if batch.stream_id == 0 {
                    warn!(msgs = batch.msgs.len(), "record batch without stream id");
                    return;
                }
                let stream_id = StreamId::new(batch.stream_id);
                let outcome = {
                    let lifecycles = self.shared.lifecycles.read();
                    self.shared.registry.lock().dispatch(batch, &lifecycles)
                };
                match outcome {
                    DispatchOutcome::Aborted { reason } => {
                        self.emit(SessionEvent::StreamAborted { stream_id, reason });
                    }
                    DispatchOutcome::Completed => {
                        self.shared.metadata.lock().forget_stream(stream_id.get());
                    }
                    _ => {}
                }
            }
            BinFrame::Lifecycles(updates) => {
                let updates: Vec<Lifecycle> = updates
                    .into_iter()
                    .filter_map(WireLifecycle::into_lifecycle)
                    .collect();
                let (total, added, revision) = {
                    let mut table = self.shared.lifecycles.write();
                    let added = table.apply(updates);
                    (table.len(), added, table.revision())
                };
                debug!(total, added, "lifecycles updated");
                self.shared.lifecycle_revision.send_replace(revision);
                self.emit(SessionEvent::LifecyclesUpdated { total, added });
            }
            BinFrame::FileInfo(info) => {
                self.shared.metadata.lock().apply_file_info(info.nr_msgs);
                self.emit(SessionEvent::FileInfo {
                    nr_msgs: info.nr_msgs,
                });
            }
            BinFrame::EacInfo(ecus) => {
                let count = ecus.len();
                self.shared.metadata.lock().apply_eac(ecus);
                self.emit(SessionEvent::EacInfo { ecus: count });
            }
            BinFrame::PluginState(raw) => {
                let (changed, errors) = self.shared.metadata.lock().apply_plugin_states(raw);
                for err in errors {
                    warn!(%err, "skipping malformed plugin state");
                    self.emit(SessionEvent::Warning(format!("plugin state: {err}")));
                }
                for name in changed {
                    self.emit(SessionEvent::PluginState { name });
                }
            }
            BinFrame::StreamInfo(info) => {
                self.shared.registry.lock().stream_info(&info);
                self.shared.metadata.lock().apply_stream_info(info.clone());
                self.emit(SessionEvent::Progress(info));
            }
        }
    }

    /// Fails every pending request and publishes `status`.
    pub fn close(&self, status: ConnectionStatus) {
        let failed = self.shared.correlator.lock().close();
        if failed > 0 {
            warn!(failed, "connection closed with requests in flight");
        }
        info!(%status, "connection closed");
        self.set_status(status);
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.send_replace(status);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Fires whenever a lifecycle update was applied.
    pub fn subscribe_lifecycles(&self) -> watch::Receiver<u64> {
        self.shared.lifecycle_revision.subscribe()
    }

    pub fn lifecycles(&self) -> RwLockReadGuard<'_, LifecycleTable> {
        self.shared.lifecycles.read()
    }

    pub fn metadata(&self) -> SessionMetadata {
        self.shared.metadata.lock().clone()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(event);
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.shared.events.clone()
    }

    /// Attaches `sink` to `id`, replaying frames that raced ahead of it.
    pub fn register_sink(&self, id: StreamId, sink: Box<dyn StreamSink>) -> Result<(), SessionError> {
        let lifecycles = self.shared.lifecycles.read();
        let mut registry = self.shared.registry.lock();
        if registry.register(id, sink, &lifecycles) {
            return Ok(());
        }
        if registry.is_retired(id) {
            return Err(SessionError::StreamAborted {
                stream_id: id,
                reason: "stream id was retired before registration".into(),
            });
        }
        Ok(())
    }

    /// Moves the sink and record buffer of `old` to `new`.
    pub fn rekey(&self, old: StreamId, new: StreamId) -> Result<(), SessionError> {
        let moved = {
            let lifecycles = self.shared.lifecycles.read();
            self.shared.registry.lock().rekey(old, new, &lifecycles)
        };
        self.shared.metadata.lock().forget_stream(old.get());
        if moved {
            Ok(())
        } else {
            Err(SessionError::StreamAborted {
                stream_id: new,
                reason: format!("no registered stream to move from {old}"),
            })
        }
    }

    pub fn unregister(&self, id: StreamId) {
        self.shared.registry.lock().unregister(id);
        self.shared.metadata.lock().forget_stream(id.get());
    }

    pub fn is_registered(&self, id: StreamId) -> bool {
        self.shared.registry.lock().is_registered(id)
    }

    pub fn record_count(&self, id: StreamId) -> Option<usize> {
        self.shared.registry.lock().record_count(id)
    }

    pub fn with_records<R>(&self, id: StreamId, f: impl FnOnce(&[Record]) -> R) -> Option<R> {
        self.shared.registry.lock().with_records(id, f)
    }

    /// Forgets streams, lifecycles and metadata of the open recording.
    pub fn reset(&self) {
        let revision = {
            let mut lifecycles = self.shared.lifecycles.write();
            lifecycles.clear();
            self.shared.registry.lock().clear();
            lifecycles.revision()
        };
        self.shared.metadata.lock().clear();
        self.shared.lifecycle_revision.send_replace(revision);
    }
}
