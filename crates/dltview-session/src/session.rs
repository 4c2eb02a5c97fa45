use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dltview_types::{EngineFilter, Filter, Record, SortMode, StreamId, Window};
use dltview_wire::{
    Command, FsCommand, parse_fs_reply, parse_search_reply, parse_stream_reply,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    Connection, SessionConfig, SessionError, SessionEvent, SinkContext, StreamSink, WindowPolicy,
};

/// Where the primary stream of a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming(StreamId),
    /// `stream_change_window` sent for `old`, replacement id not known yet.
    Rewindowing { old: StreamId },
    Stopping(StreamId),
}

/// What to open and how.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub files: Vec<String>,
    pub plugins: Vec<facet_value::Value>,
    pub sort: Option<SortMode>,
    pub filters: Vec<Filter>,
}

struct SessionState {
    open: bool,
    sort: SortMode,
    skip: u32,
    filters: Vec<Filter>,
    phase: StreamPhase,
    /// Bumped on every stream transition; replies that arrive for an older
    /// generation are not applied.
    generation: u64,
}

/// One open recording and its windowed primary stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Connection,
    config: SessionConfig,
    policy: WindowPolicy,
    files: Vec<String>,
    plugins: Vec<facet_value::Value>,
    state: Mutex<SessionState>,
    // Held across every stream transition.
    transition: tokio::sync::Mutex<()>,
    filter_rev: AtomicU64,
}

/// Feeds the visible page of the primary stream.
struct WindowSink {
    page_size: usize,
    received: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StreamSink for WindowSink {
    fn on_new_records(&mut self, ctx: &SinkContext<'_>, records: &mut Vec<Record>, added: usize) {
        let before = records.len() - added;
        records.truncate(self.page_size);
        let added = records.len().saturating_sub(before);
        self.received.store(true, Ordering::Release);
        if added > 0 {
            let _ = self.events.send(SessionEvent::RecordsAdded {
                stream_id: ctx.stream_id,
                added,
                visible: records.len(),
            });
        }
    }

    fn on_done(&mut self, ctx: &SinkContext<'_>, _records: &mut Vec<Record>) {
        let _ = self.events.send(SessionEvent::StreamDone {
            stream_id: ctx.stream_id,
        });
    }

    fn retain_after_done(&self) -> bool {
        true
    }
}

/// Hands all records of a query stream over once it ends.
struct CollectSink {
    done: Option<oneshot::Sender<Vec<Record>>>,
}

impl StreamSink for CollectSink {
    fn on_new_records(&mut self, _: &SinkContext<'_>, _: &mut Vec<Record>, _: usize) {}

    fn on_done(&mut self, _: &SinkContext<'_>, records: &mut Vec<Record>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(std::mem::take(records));
        }
    }
}

/// Filters sent with the primary stream: enabled and record-selecting.
pub fn stream_filters(filters: &[Filter]) -> Vec<EngineFilter> {
    filters
        .iter()
        .filter(|f| f.enabled && f.kind.selects_records())
        .map(Filter::to_engine)
        .collect()
}

impl Session {
    pub fn new(conn: Connection, config: SessionConfig, options: SessionOptions) -> Self {
        let config = config.validated();
        let policy = WindowPolicy::from_config(&config);
        let state = SessionState {
            open: false,
            sort: options.sort.unwrap_or(SortMode::ByIndex),
            skip: 0,
            filters: options.filters,
            phase: StreamPhase::Idle,
            generation: 0,
        };
        Self {
            inner: Arc::new(Inner {
                conn,
                config,
                policy,
                files: options.files,
                plugins: options.plugins,
                state: Mutex::new(state),
                transition: tokio::sync::Mutex::new(()),
                filter_rev: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock()
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.state().generation != generation
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> StreamPhase {
        self.state().phase
    }

    pub fn active_stream(&self) -> Option<StreamId> {
        match self.phase() {
            StreamPhase::Streaming(id) => Some(id),
            _ => None,
        }
    }

    pub fn skip(&self) -> u32 {
        self.state().skip
    }

    pub fn window(&self) -> Window {
        Window::page(self.skip(), self.inner.config.page_size)
    }

    pub fn sort(&self) -> SortMode {
        self.state().sort
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.state().filters.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn visible_count(&self) -> usize {
        self.active_stream()
            .and_then(|id| self.inner.conn.record_count(id))
            .unwrap_or(0)
    }

    pub fn visible_records(&self) -> Vec<Record> {
        self.active_stream()
            .and_then(|id| self.inner.conn.with_records(id, <[Record]>::to_vec))
            .unwrap_or_default()
    }

    /// Opens the recording, waits for lifecycle info (or the fallback
    /// timeout) and starts the primary stream at the current skip.
    pub async fn open(&self) -> Result<StreamId, SessionError> {
        let _guard = self.inner.transition.lock().await;
        self.open_locked().await?;
        self.start_stream_locked().await
    }

    async fn open_locked(&self) -> Result<(), SessionError> {
        let conn = &self.inner.conn;
        let mut lifecycles = conn.subscribe_lifecycles();
        lifecycles.borrow_and_update();
        let sort = self.sort();
        conn.send(&Command::Open {
            sort_by_time: sort.by_time(),
            files: self.inner.files.clone(),
            plugins: self.inner.plugins.clone(),
        })
        .await?;
        self.state().open = true;
        info!(files = ?self.inner.files, ?sort, "recording opened");

        let fallback = self.inner.config.metadata_fallback;
        match tokio::time::timeout(fallback, lifecycles.changed()).await {
            Ok(_) => debug!(lifecycles = conn.lifecycles().len(), "lifecycles known"),
            Err(_) => warn!(?fallback, "no lifecycle info arrived, streaming anyway"),
        }
        Ok(())
    }

    async fn start_stream_locked(&self) -> Result<StreamId, SessionError> {
        let (window, filters, generation) = {
            let mut st = self.state();
            if !st.open {
                return Err(SessionError::Closed);
            }
            st.generation += 1;
            st.phase = StreamPhase::Idle;
            (
                Window::page(st.skip, self.inner.config.page_size),
                stream_filters(&st.filters),
                st.generation,
            )
        };
        let conn = &self.inner.conn;
        let reply = conn.send(&Command::Stream { window, filters }).await?;
        let id = parse_stream_reply("stream", &reply)?;
        if self.is_stale(generation) {
            self.discard(id).await;
            return Err(SessionError::Superseded {
                operation: "stream",
            });
        }

        let received = Arc::new(AtomicBool::new(false));
        let sink = WindowSink {
            page_size: self.inner.config.page_size as usize,
            received: received.clone(),
            events: conn.event_sender(),
        };
        if let Err(e) = conn.register_sink(id, Box::new(sink)) {
            self.discard(id).await;
            return Err(e);
        }
        self.state().phase = StreamPhase::Streaming(id);
        info!(stream_id = %id, %window, "stream started");
        conn.emit(SessionEvent::WindowChanged {
            stream_id: id,
            window,
        });
        self.arm_empty_result(id, generation, received);
        Ok(id)
    }

    fn arm_empty_result(&self, id: StreamId, generation: u64, received: Arc<AtomicBool>) {
        let session = self.clone();
        let delay = self.inner.config.empty_result_after;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if received.load(Ordering::Acquire) || session.is_stale(generation) {
                return;
            }
            debug!(stream_id = %id, ?delay, "no records arrived");
            session
                .inner
                .conn
                .emit(SessionEvent::EmptyResult { stream_id: id });
        });
    }

    /// Retires a stream that lost against a newer transition or could not
    /// be registered, and stops it on the engine.
    async fn discard(&self, id: StreamId) {
        warn!(stream_id = %id, "discarding stream, stopping it on the engine");
        self.inner.conn.unregister(id);
        if let Err(e) = self.inner.conn.send(&Command::Stop { id }).await {
            debug!(stream_id = %id, %e, "stopping stale stream failed");
        }
    }

    pub async fn stop_stream(&self) -> Result<(), SessionError> {
        let _guard = self.inner.transition.lock().await;
        self.stop_stream_locked().await
    }

    async fn stop_stream_locked(&self) -> Result<(), SessionError> {
        let id = {
            let mut st = self.state();
            let StreamPhase::Streaming(id) = st.phase else {
                return Ok(());
            };
            st.generation += 1;
            st.phase = StreamPhase::Stopping(id);
            id
        };
        self.inner.conn.unregister(id);
        let result = self.inner.conn.send(&Command::Stop { id }).await;
        self.state().phase = StreamPhase::Idle;
        match result {
            Ok(_) => {
                debug!(stream_id = %id, "stream stopped");
                Ok(())
            }
            Err(SessionError::Rpc(e)) if e.is_no_active_stream() => {
                debug!(stream_id = %id, "stream already gone on the engine side");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Moves the primary stream to `[skip, skip + page_size)`.
    pub async fn change_window(&self, skip: u32) -> Result<Window, SessionError> {
        let _guard = self.inner.transition.lock().await;
        self.change_window_locked(skip).await
    }

    async fn change_window_locked(&self, skip: u32) -> Result<Window, SessionError> {
        let window = Window::page(skip, self.inner.config.page_size);
        let (old, generation) = {
            let mut st = self.state();
            let StreamPhase::Streaming(old) = st.phase else {
                return Err(SessionError::NoActiveStream);
            };
            st.generation += 1;
            st.phase = StreamPhase::Rewindowing { old };
            (old, st.generation)
        };
        let conn = &self.inner.conn;
        let reply = conn.send(&Command::ChangeWindow { id: old, window }).await;
        let new = match reply.and_then(|reply| {
            parse_stream_reply("stream_change_window", &reply).map_err(SessionError::from)
        }) {
            Ok(new) => new,
            Err(e) => {
                let mut st = self.state();
                if st.generation == generation {
                    st.phase = StreamPhase::Streaming(old);
                }
                return Err(e);
            }
        };
        if self.is_stale(generation) {
            self.discard(new).await;
            return Err(SessionError::Superseded {
                operation: "stream_change_window",
            });
        }
        if let Err(e) = conn.rekey(old, new) {
            self.state().phase = StreamPhase::Idle;
            conn.emit(SessionEvent::StreamAborted {
                stream_id: new,
                reason: e.to_string(),
            });
            return Err(e);
        }
        {
            let mut st = self.state();
            st.skip = skip;
            st.phase = StreamPhase::Streaming(new);
        }
        info!(old = %old, new = %new, %window, "window changed");
        conn.emit(SessionEvent::WindowChanged {
            stream_id: new,
            window,
        });
        Ok(window)
    }

    /// Reports the visible range `[top, bottom]` within the page and
    /// re-windows if it came close to an edge.
    ///
    /// Ignored while another transition is in flight; the next scroll
    /// notification is evaluated against the settled window.
    pub async fn on_visible_range(&self, top: u32, bottom: u32) -> Result<Option<Window>, SessionError> {
        let Ok(_guard) = self.inner.transition.try_lock() else {
            debug!(top, bottom, "transition in flight, ignoring visible range");
            return Ok(None);
        };
        let (skip, id) = {
            let st = self.state();
            let StreamPhase::Streaming(id) = st.phase else {
                return Ok(None);
            };
            (st.skip, id)
        };
        let visible = self.inner.conn.record_count(id).unwrap_or(0);
        let Some(new_skip) = self.inner.policy.plan(top, bottom, skip, visible) else {
            return Ok(None);
        };
        if new_skip == skip {
            return Ok(None);
        }
        debug!(top, bottom, skip, new_skip, "re-windowing on scroll");
        self.change_window_locked(new_skip).await.map(Some)
    }

    /// Replaces the filter set. The stream restarts after the debounce
    /// delay; edits within the delay collapse into one restart.
    pub fn set_filters(&self, filters: Vec<Filter>) {
        self.state().filters = filters;
        let rev = self.inner.filter_rev.fetch_add(1, Ordering::AcqRel) + 1;
        let session = self.clone();
        let delay = self.inner.config.filter_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if session.inner.filter_rev.load(Ordering::Acquire) != rev {
                debug!(rev, "filter change superseded by a newer edit");
                return;
            }
            if let Err(e) = session.restart().await {
                warn!(%e, "restarting stream with new filters failed");
                session
                    .inner
                    .conn
                    .emit(SessionEvent::Warning(format!("filter restart failed: {e}")));
            }
        });
    }

    /// Stops the primary stream and starts it again from the first page
    /// with the current filters. Waits for a transition in flight.
    pub async fn restart(&self) -> Result<StreamId, SessionError> {
        let _guard = self.inner.transition.lock().await;
        self.stop_stream_locked().await?;
        self.state().skip = 0;
        self.start_stream_locked().await
    }

    /// Switches between index and time order. Lifecycle ids are derived
    /// per ordering, so the recording is closed and opened again.
    pub async fn toggle_sort(&self) -> Result<StreamId, SessionError> {
        self.state().generation += 1;
        let _guard = self.inner.transition.lock().await;
        self.close_locked().await?;
        {
            let mut st = self.state();
            st.sort = st.sort.toggled();
        }
        self.open_locked().await?;
        self.start_stream_locked().await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.state().generation += 1;
        let _guard = self.inner.transition.lock().await;
        self.close_locked().await
    }

    async fn close_locked(&self) -> Result<(), SessionError> {
        let was_open = {
            let mut st = self.state();
            let was_open = st.open;
            st.open = false;
            st.phase = StreamPhase::Idle;
            st.skip = 0;
            was_open
        };
        if !was_open {
            return Ok(());
        }
        let result = self.inner.conn.send(&Command::Close).await;
        self.inner.conn.reset();
        info!("recording closed");
        result.map(|_| ())
    }

    /// Index of the first record at or after `time_ms` in the current
    /// stream, if any.
    pub async fn search_time(&self, time_ms: u64) -> Result<Option<u32>, SessionError> {
        let _guard = self.inner.transition.lock().await;
        let id = self.active_stream().ok_or(SessionError::NoActiveStream)?;
        let reply = self
            .inner
            .conn
            .send(&Command::BinarySearch { id, time_ms })
            .await?;
        Ok(parse_search_reply(&reply)?)
    }

    /// Re-windows so that `index` lies within the page.
    pub async fn reveal_index(&self, index: u32) -> Result<Option<Window>, SessionError> {
        let _guard = self.inner.transition.lock().await;
        let Some(skip) = self.inner.policy.reveal(index, self.skip()) else {
            return Ok(None);
        };
        self.change_window_locked(skip).await.map(Some)
    }

    /// Runs a one-shot query and collects all matching records.
    pub async fn query(&self, window: Window, filters: &[Filter]) -> Result<Vec<Record>, SessionError> {
        let conn = &self.inner.conn;
        let reply = conn
            .send(&Command::Query {
                window,
                filters: stream_filters(filters),
            })
            .await?;
        let id = parse_stream_reply("query", &reply)?;
        let (tx, rx) = oneshot::channel();
        conn.register_sink(id, Box::new(CollectSink { done: Some(tx) }))?;
        let records = rx.await.map_err(|_| SessionError::StreamAborted {
            stream_id: id,
            reason: "query dropped before it completed".into(),
        })?;
        debug!(stream_id = %id, records = records.len(), "query done");
        Ok(records)
    }

    /// Starts a secondary stream feeding `sink`, independent of the
    /// primary window.
    pub async fn attach_stream(
        &self,
        window: Window,
        filters: Vec<EngineFilter>,
        sink: Box<dyn StreamSink>,
    ) -> Result<StreamId, SessionError> {
        let conn = &self.inner.conn;
        let reply = conn.send(&Command::Stream { window, filters }).await?;
        let id = parse_stream_reply("stream", &reply)?;
        conn.register_sink(id, sink)?;
        debug!(stream_id = %id, %window, "secondary stream attached");
        Ok(id)
    }

    pub async fn detach_stream(&self, id: StreamId) -> Result<(), SessionError> {
        self.inner.conn.unregister(id);
        match self.inner.conn.send(&Command::Stop { id }).await {
            Err(SessionError::Rpc(e)) if e.is_no_active_stream() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    pub async fn fs(&self, cmd: FsCommand, path: &str) -> Result<facet_value::Value, SessionError> {
        let reply = self
            .inner
            .conn
            .send(&Command::Fs {
                cmd,
                path: path.to_string(),
            })
            .await?;
        Ok(parse_fs_reply(&reply)?)
    }
}
