//! Tunnel connection controller.
//!
//! [`TunnelController`] owns one tunnel attempt at a time: it drives the
//! connector, reacts to transport notifications through the state machine,
//! runs the framed read loop, dispatches inbound commands, and resolves the
//! caller's start and stop completions exactly once each.
//!
//! Locking is deliberately shallow. All lifecycle bookkeeping lives in one
//! `Inner` behind a synchronous mutex that is never held across an await;
//! the stream writer sits behind its own async mutex so concurrent sends
//! serialize without touching lifecycle state.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use culvert_proto::{
    frame, key, Command, Frame, Message, OpenResultCode, Properties, LENGTH_PREFIX_LEN,
};
use culvert_transport::{
    event_channel, EventReceiver, StreamConnector, StreamHandle, StreamReader, StreamWriter,
    TransportEvent,
};
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::error::TunnelError;
use crate::logq::LogQueue;
use crate::settings::{InterfaceConfigurator, InterfaceSettings};
use crate::state::{ConnectionState, StartDecision, StateMachine, StopDecision, Transition};

/// Identifier requested for the tunnel's logical connection. Zero is
/// reserved for the control channel.
const LOGICAL_CONNECTION_ID: u32 = 1;

type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn StreamWriter>>>;

/// Tunable knobs for a controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Tunnel type requested when opening the logical connection.
    pub tunnel_type: String,
    /// Cap on buffered diagnostic log entries. `None` is unbounded.
    pub log_capacity: Option<usize>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tunnel_type: "packet".to_string(),
            log_capacity: None,
        }
    }
}

/// Outcome of a start call.
#[derive(Debug)]
pub enum StartHandle {
    /// A new attempt is underway. The receiver resolves exactly once with
    /// the attempt's outcome.
    Pending(oneshot::Receiver<Result<(), TunnelError>>),
    /// An attempt was already in flight; no new connection was made.
    AlreadyStarted,
}

/// Everything one attempt needs to write to its own stream.
///
/// Captured when the session opens so tasks from a finished attempt can
/// never write into a newer one.
#[derive(Debug, Clone)]
struct SessionContext {
    generation: u64,
    writer: SharedWriter,
}

#[derive(Debug)]
struct Inner {
    machine: StateMachine,
    /// Incremented per start. Tasks carry the generation they were spawned
    /// for and their effects are discarded once it goes stale.
    generation: u64,
    pending_start: Option<oneshot::Sender<Result<(), TunnelError>>>,
    pending_stop: Vec<oneshot::Sender<()>>,
    /// First fatal error of the attempt; the cancel confirmation delivers it.
    close_reason: Option<TunnelError>,
    reader: Option<Box<dyn StreamReader>>,
    writer: Option<SharedWriter>,
    cancel: Option<culvert_transport::CancelHandle>,
    connected_seen: bool,
    session_started: bool,
    open_sent: bool,
    logical_open: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            generation: 0,
            pending_start: None,
            pending_stop: Vec::new(),
            close_reason: None,
            reader: None,
            writer: None,
            cancel: None,
            connected_seen: false,
            session_started: false,
            open_sent: false,
            logical_open: false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: ControllerConfig,
    connector: Arc<dyn StreamConnector>,
    configurator: Arc<dyn InterfaceConfigurator>,
    log_queue: LogQueue,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

/// Drives the lifecycle of a single tunnel connection.
///
/// Cheap to clone; all clones share the same attempt state.
#[derive(Debug, Clone)]
pub struct TunnelController {
    shared: Arc<Shared>,
}

impl TunnelController {
    pub fn new(
        config: ControllerConfig,
        connector: Arc<dyn StreamConnector>,
        configurator: Arc<dyn InterfaceConfigurator>,
    ) -> Self {
        let log_queue = match config.log_capacity {
            Some(capacity) => LogQueue::bounded(capacity),
            None => LogQueue::new(),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                configurator,
                log_queue,
                state_tx,
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    /// Begin a tunnel attempt toward `server_address`.
    ///
    /// Returns [`StartHandle::AlreadyStarted`] without touching the network
    /// when an attempt is already in flight. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, server_address: &str) -> Result<StartHandle, TunnelError> {
        let address = server_address.trim();
        if address.is_empty() {
            return Err(TunnelError::BadConfiguration(
                "server address is empty".to_string(),
            ));
        }

        let mut inner = self.shared.inner.lock().unwrap();
        match inner.machine.start() {
            StartDecision::StoppingInProgress => {
                self.log("Start requested while a teardown is still resolving");
                Err(TunnelError::InternalError(
                    "start requested during stop".to_string(),
                ))
            }
            StartDecision::AlreadyStarted => {
                self.log("Start tunnel requested when tunnel was already started");
                Ok(StartHandle::AlreadyStarted)
            }
            StartDecision::Proceed => {
                debug_assert!(inner.pending_start.is_none(), "stale start completion");
                inner.generation = inner.generation.wrapping_add(1);
                let generation = inner.generation;
                self.publish_state(&inner);
                self.log(format!("Starting tunnel to {address}"));

                let (tx, rx) = oneshot::channel();
                inner.pending_start = Some(tx);

                let (events_tx, events_rx) = event_channel();

                let controller = self.clone();
                tokio::spawn(async move {
                    controller.run_events(generation, events_rx).await;
                });

                let controller = self.clone();
                let connector = self.shared.connector.clone();
                let address = address.to_string();
                tokio::spawn(async move {
                    match connector.connect(&address, events_tx).await {
                        Ok(handle) => controller.install_stream(generation, handle),
                        Err(err) => {
                            // The Failed notification resolves the attempt.
                            debug!("tunnel connect attempt failed: {err}");
                        }
                    }
                });

                Ok(StartHandle::Pending(rx))
            }
        }
    }

    /// Request a teardown of the current attempt.
    ///
    /// The returned receiver resolves once the transport has confirmed the
    /// close, or immediately when nothing is running. A start still pending
    /// resolves with [`TunnelError::Cancelled`] before the teardown begins.
    pub fn stop(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.machine.stop() {
            StopDecision::NothingToDo => {
                if inner.close_reason.is_some() {
                    // An error close is already resolving; join it.
                    inner.pending_stop.push(tx);
                } else {
                    self.log("Stop requested with no active tunnel");
                    let _ = tx.send(());
                }
            }
            StopDecision::AlreadyStopping => {
                inner.pending_stop.push(tx);
            }
            StopDecision::Teardown => {
                self.publish_state(&inner);
                self.log("Stopping tunnel");
                if let Some(start_tx) = inner.pending_start.take() {
                    let _ = start_tx.send(Err(TunnelError::Cancelled));
                }
                inner.pending_stop.push(tx);
                match inner.cancel.clone() {
                    Some(cancel) => cancel.cancel(),
                    None => {
                        // Connect still in flight. Its resolution finds the
                        // teardown and finishes it.
                    }
                }
            }
        }
        rx
    }

    /// Send a message over the established tunnel.
    ///
    /// Fails with [`TunnelError::NotConnected`] outside the `Connected`
    /// state. A write failure tears the tunnel down with the same error.
    pub async fn send(&self, message: &Message) -> Result<(), TunnelError> {
        let (writer, generation) = {
            let inner = self.shared.inner.lock().unwrap();
            if inner.machine.state() != &ConnectionState::Connected {
                return Err(TunnelError::NotConnected);
            }
            let writer = inner.writer.clone().ok_or(TunnelError::BadConnection)?;
            (writer, inner.generation)
        };
        match self.write_to(&writer, message).await {
            Ok(()) => Ok(()),
            // Encode-side failures leave the stream untouched.
            Err(err @ (TunnelError::InvalidMessage(_) | TunnelError::OversizedMessage(_))) => {
                Err(err)
            }
            Err(err) => {
                self.begin_close(generation, err.clone());
                Err(err)
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().unwrap().machine.state().clone()
    }

    /// Watch channel following every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Oldest buffered diagnostic entry, or an empty string.
    pub fn poll_log(&self) -> String {
        self.shared.log_queue.dequeue().unwrap_or_default()
    }

    /// Service one poll of the external diagnostic channel.
    ///
    /// The first poll of an attempt confirms the control channel is live.
    /// The payload itself is ignored; any message counts as a poll.
    pub fn handle_app_message(&self, payload: &[u8]) -> String {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.machine.note_poll() {
                debug!("control channel poll observed; attempt confirmed connecting");
            }
        }
        if !payload.is_empty() {
            debug!(len = payload.len(), "app message payload ignored");
        }
        self.poll_log()
    }

    async fn run_events(self, generation: u64, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(generation, event);
        }
        debug!(generation, "transport event channel closed");
    }

    fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.generation != generation {
            debug!(?event, "discarding transport event from a finished attempt");
            return;
        }
        match inner.machine.apply(&event) {
            Transition::Noted => {
                self.log("Connecting to tunnel server");
            }
            Transition::SessionOpen => {
                self.publish_state(&inner);
                self.log("Tunnel connection established");
                inner.connected_seen = true;
                self.start_session_if_ready(&mut inner);
            }
            Transition::StreamLost => {
                self.publish_state(&inner);
                self.log("Tunnel transport disconnected");
                if inner.close_reason.is_none() {
                    inner.close_reason = Some(TunnelError::Disconnected(
                        "transport reported disconnection".to_string(),
                    ));
                }
                self.cancel_or_finish(&mut inner);
            }
            Transition::AttemptOver => {
                self.publish_state(&inner);
                let fallback = match &event {
                    TransportEvent::Failed(reason) => {
                        self.log(format!("Tunnel connection failed: {reason}"));
                        Some(TunnelError::Disconnected(reason.clone()))
                    }
                    _ => None,
                };
                self.finish_attempt(&mut inner, fallback);
            }
            Transition::Ignored => {
                debug!(?event, state = ?inner.machine.state(), "transport event ignored");
            }
        }
    }

    /// Store the freshly connected stream, unless the attempt already died.
    fn install_stream(&self, generation: u64, handle: StreamHandle) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.generation != generation
            || inner.machine.is_stopping()
            || inner.machine.state().is_terminal()
            || inner.close_reason.is_some()
        {
            debug!("dropping stream handed to a finished attempt");
            handle.cancel.cancel();
            return;
        }
        inner.reader = Some(handle.reader);
        inner.writer = Some(Arc::new(tokio::sync::Mutex::new(handle.writer)));
        inner.cancel = Some(handle.cancel);
        self.start_session_if_ready(&mut inner);
    }

    /// Once both the Connected notification and the stream halves are in,
    /// spawn the read loop and kick off the configuration handshake.
    fn start_session_if_ready(&self, inner: &mut Inner) {
        if inner.session_started || !inner.connected_seen {
            return;
        }
        let Some(reader) = inner.reader.take() else {
            // Connected arrived before the connect call returned the
            // stream; install_stream finishes the job.
            return;
        };
        let Some(writer) = inner.writer.clone() else {
            return;
        };
        inner.session_started = true;
        let session = SessionContext {
            generation: inner.generation,
            writer,
        };

        let controller = self.clone();
        let read_session = session.clone();
        tokio::spawn(async move {
            controller.read_loop(read_session, reader).await;
        });

        let controller = self.clone();
        tokio::spawn(async move {
            controller.request_configuration(session).await;
        });
    }

    async fn request_configuration(&self, session: SessionContext) {
        self.log("Requesting tunnel configuration");
        let request = Message::fetch_configuration();
        if let Err(err) = self.write_to(&session.writer, &request).await {
            self.begin_close(session.generation, err);
        }
    }

    /// Frame-at-a-time read loop. Runs until the stream errors, the frame
    /// layer rejects a length prefix, or a dispatched message proves fatal.
    async fn read_loop(self, session: SessionContext, mut reader: Box<dyn StreamReader>) {
        loop {
            let prefix = match reader.read(LENGTH_PREFIX_LEN, LENGTH_PREFIX_LEN).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    self.close_on_stream_error(session.generation, err.into());
                    return;
                }
            };
            let mut header = [0u8; LENGTH_PREFIX_LEN];
            header.copy_from_slice(&prefix);

            let payload_len = match frame::payload_len(header) {
                Ok(len) => len,
                Err(err) => {
                    self.log(format!("Dropping connection: {err}"));
                    self.begin_close(session.generation, err.into());
                    return;
                }
            };

            let payload = if payload_len == 0 {
                Bytes::new()
            } else {
                match reader.read(payload_len, payload_len).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        self.close_on_stream_error(session.generation, err.into());
                        return;
                    }
                }
            };

            if let Err(err) = self.dispatch_payload(&session, payload).await {
                if err.is_fatal() {
                    self.begin_close(session.generation, err);
                    return;
                }
                // Framing is still aligned after a bad payload; the length
                // prefix was consumed in full. Keep reading.
            }
        }
    }

    fn close_on_stream_error(&self, generation: u64, err: TunnelError) {
        if err == TunnelError::Cancelled {
            // Cancellation already flows through the event channel.
            debug!("read loop ended: stream cancelled");
            return;
        }
        self.begin_close(generation, err);
    }

    /// Decode one frame payload and hand it to the matching handler.
    async fn dispatch_payload(
        &self,
        session: &SessionContext,
        payload: Bytes,
    ) -> Result<(), TunnelError> {
        let message = match Message::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                self.log(format!("Ignoring invalid message: {err}"));
                return Err(err.into());
            }
        };
        debug!(
            command = ?message.command,
            connection_id = message.connection_id,
            "dispatching inbound message"
        );
        match message.command {
            Command::OpenResult => self.handle_open_result(session, &message),
            Command::FetchConfiguration => self.handle_configuration(session, &message).await,
            Command::Data => {
                let bytes = message
                    .properties
                    .get_bytes(key::PACKETS)
                    .map(|data| data.len())
                    .unwrap_or(0);
                self.log(format!(
                    "Received {bytes} data bytes for connection {}",
                    message.connection_id
                ));
                Ok(())
            }
            other => {
                self.log(format!("No handler for {other:?} message"));
                Err(TunnelError::InvalidMessage(format!(
                    "unhandled command {other:?}"
                )))
            }
        }
    }

    fn handle_open_result(
        &self,
        session: &SessionContext,
        message: &Message,
    ) -> Result<(), TunnelError> {
        let code = message
            .properties
            .get_int(key::RESULT_CODE)
            .and_then(OpenResultCode::from_i64);
        let Some(code) = code else {
            self.log("Open result carried no usable result code");
            return Err(TunnelError::InvalidMessage(
                "open result without result code".to_string(),
            ));
        };
        if message.connection_id != LOGICAL_CONNECTION_ID {
            self.log(format!(
                "Open result for unknown connection {}",
                message.connection_id
            ));
            return Err(TunnelError::InvalidMessage(format!(
                "unknown connection {}",
                message.connection_id
            )));
        }

        let mut inner = self.shared.inner.lock().unwrap();
        if inner.generation != session.generation {
            return Ok(());
        }
        match code {
            OpenResultCode::Success => {
                inner.logical_open = true;
                self.log(format!("Connection {LOGICAL_CONNECTION_ID} is open"));
            }
            other => {
                inner.logical_open = false;
                self.log(format!(
                    "Connection {LOGICAL_CONNECTION_ID} failed to open: {other:?}"
                ));
            }
        }
        Ok(())
    }

    /// Apply the configuration the server sent back, then finish the
    /// session handshake: request the logical connection and resolve the
    /// pending start.
    async fn handle_configuration(
        &self,
        session: &SessionContext,
        message: &Message,
    ) -> Result<(), TunnelError> {
        let Some(blob) = message.properties.get_bytes(key::CONFIGURATION) else {
            self.log("Configuration response carried no configuration");
            return Err(TunnelError::InvalidMessage(
                "missing configuration property".to_string(),
            ));
        };
        let table = match Properties::decode(blob) {
            Ok(table) => table,
            Err(err) => {
                self.log(format!("Undecodable configuration: {err}"));
                return Err(err.into());
            }
        };
        let settings = match InterfaceSettings::from_configuration(&table) {
            Ok(settings) => settings,
            Err(err) => {
                self.log(format!("Rejected tunnel configuration: {err}"));
                self.complete_start(
                    session.generation,
                    Err(TunnelError::BadConfiguration(err.to_string())),
                );
                return Ok(());
            }
        };

        self.log(format!(
            "Applying interface settings for {}",
            settings.address
        ));
        if let Err(err) = self.shared.configurator.apply(settings).await {
            self.log(format!("Interface settings were not applied: {err}"));
            self.complete_start(
                session.generation,
                Err(TunnelError::BadConfiguration(err.to_string())),
            );
            return Ok(());
        }

        let open_needed = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.generation != session.generation {
                return Ok(());
            }
            !std::mem::replace(&mut inner.open_sent, true)
        };
        if open_needed {
            let open = Message::open(LOGICAL_CONNECTION_ID, &self.shared.config.tunnel_type);
            if let Err(err) = self.write_to(&session.writer, &open).await {
                self.begin_close(session.generation, err);
                return Ok(());
            }
            self.log(format!(
                "Requested {} connection {LOGICAL_CONNECTION_ID}",
                self.shared.config.tunnel_type
            ));
        }
        // Resolved only after the open request is on the wire, so sends
        // issued by the awakened caller land behind it.
        self.complete_start(session.generation, Ok(()));
        Ok(())
    }

    fn complete_start(&self, generation: u64, outcome: Result<(), TunnelError>) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.generation != generation {
            return;
        }
        if let Some(tx) = inner.pending_start.take() {
            if outcome.is_ok() {
                self.log("Tunnel start complete");
            }
            let _ = tx.send(outcome);
        }
    }

    async fn write_to(
        &self,
        writer: &SharedWriter,
        message: &Message,
    ) -> Result<(), TunnelError> {
        let payload = message.encode()?;
        let frame = Frame::new(payload)?;
        let mut writer = writer.lock().await;
        writer.write(frame.encode()).await?;
        Ok(())
    }

    /// Funnel for every fatal error. Records the first reason, cancels the
    /// stream, and lets the cancel confirmation finish the attempt. Later
    /// calls for the same attempt are no-ops.
    fn begin_close(&self, generation: u64, error: TunnelError) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.generation != generation {
            debug!("discarding close from a finished attempt: {error}");
            return;
        }
        if inner.machine.state().is_terminal() || inner.close_reason.is_some() {
            return;
        }
        self.log(format!("Closing tunnel: {error}"));
        inner.close_reason = Some(error);
        self.cancel_or_finish(&mut inner);
    }

    /// Cancel the stream if one exists; with no stream to confirm the
    /// cancel, resolve the attempt on the spot.
    fn cancel_or_finish(&self, inner: &mut Inner) {
        match inner.cancel.clone() {
            Some(cancel) => cancel.cancel(),
            None => {
                if inner.machine.apply(&TransportEvent::Cancelled) == Transition::AttemptOver {
                    self.publish_state(inner);
                    self.finish_attempt(inner, None);
                }
            }
        }
    }

    /// Fire the pending completions exactly once and drop all per-attempt
    /// stream state. The terminal connection state stays visible.
    fn finish_attempt(&self, inner: &mut Inner, fallback: Option<TunnelError>) {
        let error = inner.close_reason.take().or(fallback);
        if let Some(tx) = inner.pending_start.take() {
            let _ = tx.send(Err(error.unwrap_or(TunnelError::Cancelled)));
        }
        for tx in inner.pending_stop.drain(..) {
            let _ = tx.send(());
        }
        inner.reader = None;
        inner.writer = None;
        inner.cancel = None;
        inner.connected_seen = false;
        inner.session_started = false;
        inner.open_sent = false;
        inner.logical_open = false;
        inner.machine.reset();
        self.log("Tunnel closed");
    }

    fn publish_state(&self, inner: &Inner) {
        self.shared.state_tx.send_replace(inner.machine.state().clone());
    }

    fn log(&self, entry: impl Into<String>) {
        let entry = entry.into();
        debug!("{entry}");
        self.shared.log_queue.enqueue(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use culvert_transport::{EventSender, TransportError, TransportResult};

    #[derive(Debug)]
    struct UnreachableConnector;

    #[async_trait]
    impl StreamConnector for UnreachableConnector {
        async fn connect(
            &self,
            _address: &str,
            events: EventSender,
        ) -> TransportResult<StreamHandle> {
            events.emit(TransportEvent::Failed("unreachable".to_string()));
            Err(TransportError::ConnectFailed("unreachable".to_string()))
        }
    }

    #[derive(Debug)]
    struct NoopConfigurator;

    #[async_trait]
    impl InterfaceConfigurator for NoopConfigurator {
        async fn apply(&self, _settings: InterfaceSettings) -> Result<(), crate::SettingsError> {
            Ok(())
        }
    }

    fn controller() -> TunnelController {
        TunnelController::new(
            ControllerConfig::default(),
            Arc::new(UnreachableConnector),
            Arc::new(NoopConfigurator),
        )
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.tunnel_type, "packet");
        assert_eq!(config.log_capacity, None);
    }

    #[test]
    fn test_start_rejects_empty_address() {
        let controller = controller();
        assert!(matches!(
            controller.start("   "),
            Err(TunnelError::BadConfiguration(_))
        ));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_connected() {
        let controller = controller();
        let message = Message::fetch_configuration();
        assert_eq!(
            controller.send(&message).await,
            Err(TunnelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_stop_with_nothing_running_completes_immediately() {
        let controller = controller();
        controller.stop().await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_poll_log_on_empty_queue_is_empty_string() {
        let controller = controller();
        assert_eq!(controller.poll_log(), "");
    }
}
