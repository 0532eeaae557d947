use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::store::SettingsStore;
use crate::config::types::SettingsField;
use crate::device::constants::READ_CHUNK_SIZE;
use crate::device::types::{Activity, ConnectionState, TransportKind};
use crate::error::{Failure, LinkError};
use crate::link::state::LinkState;
use crate::transport::ClassicConnector;
use crate::workers::{lock, Workers};

struct Connection<S> {
    id: u64,
    address: String,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    /// Taken by the single receive loop.
    reader: Option<ReadHalf<S>>,
    cancel: CancellationToken,
}

/// Calls the completion callback exactly once, with `false` if the attempt is dropped unfinished.
struct Completion<F: FnOnce(bool)>(Option<F>);

impl<F: FnOnce(bool)> Completion<F> {
    fn complete(mut self, connected: bool) {
        if let Some(callback) = self.0.take() {
            callback(connected);
        }
    }
}

impl<F: FnOnce(bool)> Drop for Completion<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(false);
        }
    }
}

struct Inner<C: ClassicConnector> {
    connector: C,
    settings: Arc<dyn SettingsStore>,
    state: Arc<LinkState>,
    workers: Workers,
    connection: Mutex<Option<Connection<C::Stream>>>,
    /// Bumped by every connect and disconnect; a connect that finishes behind a newer bump is abandoned.
    attempt: AtomicU64,
    next_id: AtomicU64,
}

/// A serial byte stream over RFCOMM.
pub struct ClassicSession<C: ClassicConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: ClassicConnector> Clone for ClassicSession<C> {
    fn clone(&self) -> Self {
        ClassicSession { inner: self.inner.clone() }
    }
}

impl<C: ClassicConnector> ClassicSession<C> {
    pub fn new(connector: C, settings: Arc<dyn SettingsStore>, state: Arc<LinkState>, workers: Workers) -> Self {
        ClassicSession {
            inner: Arc::new(Inner {
                connector,
                settings,
                state,
                workers,
                connection: Mutex::new(None),
                attempt: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Opens the serial channel in the background. `on_complete` runs once with the outcome.
    /// Fails straight away with `AlreadyConnected` while BLE holds the link.
    pub fn connect<F>(&self, address: &str, service: Uuid, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let completion = Completion(Some(on_complete));
        let inner = self.inner.clone();
        let address = address.to_string();

        let claimed = {
            let _connection = lock(&inner.connection);
            inner.state.claim(TransportKind::Classic).map(|()| {
                inner.state.publish_classic(ConnectionState::Connecting);
                inner.attempt.fetch_add(1, Ordering::SeqCst) + 1
            })
        };
        let attempt = match claimed {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!("Not connecting (Classic) to {}: {}", address, err);
                inner.state.publish_classic(ConnectionState::Failed(Failure::from(&err)));
                completion.complete(false);
                return;
            },
        };
        info!("Connecting (Classic) to {}...", address);

        self.inner.workers.spawn("classic-connect", async move {
            match inner.connector.connect(&address, service).await {
                Ok(stream) => {
                    if !inner.attach(attempt, address.clone(), stream) {
                        info!("Classic connection to {} was abandoned", address);
                        completion.complete(false);
                        return;
                    }

                    info!("Connected (Classic) to {}", address);
                    inner.remember(address);
                    completion.complete(true);
                },
                Err(err) => {
                    inner.fail(attempt, &address, err);
                    completion.complete(false);
                },
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.connection).is_some()
    }

    pub fn connected_address(&self) -> Option<String> {
        lock(&self.inner.connection).as_ref().map(|connection| connection.address.clone())
    }

    /// Queues bytes for the writer worker; the outcome is published as activity.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), LinkError> {
        let result = match lock(&self.inner.connection).as_ref() {
            Some(connection) => connection.writer
                .send(bytes)
                .map_err(|_| LinkError::NotConnected(TransportKind::Classic)),
            None => Err(LinkError::NotConnected(TransportKind::Classic)),
        };

        if let Err(err) = &result {
            warn!("Classic send failed: {}", err);
            self.inner.state.publish_activity(Activity::SendFailed(TransportKind::Classic, Failure::from(err)));
        }
        result
    }

    /// Delivers raw chunks of up to [`READ_CHUNK_SIZE`] bytes until the stream ends.
    pub fn receive<F>(&self, mut on_chunk: F) -> Result<(), LinkError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let (id, mut reader, cancel) = self.take_reader()?;
        let inner = self.inner.clone();

        self.inner.workers.spawn("classic-receive", async move {
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];

            'mainloop: loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    result = reader.read(&mut buffer) => result,
                };

                match result {
                    Ok(0) => {
                        inner.connection_lost(id, None);
                        break 'mainloop;
                    },
                    Ok(count) => on_chunk(&buffer[..count]),
                    Err(err) => {
                        inner.connection_lost(id, Some(LinkError::from(err)));
                        break 'mainloop;
                    },
                }
            }
        });
        Ok(())
    }

    /// Delivers newline framed text lines, without the terminator, until the stream ends.
    pub fn read_lines<F>(&self, mut on_line: F) -> Result<(), LinkError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let (id, reader, cancel) = self.take_reader()?;
        let inner = self.inner.clone();

        self.inner.workers.spawn("classic-lines", async move {
            let codec = AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec());
            let mut lines = FramedRead::new(reader, codec);

            'mainloop: loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    next = lines.next() => next,
                };

                match next {
                    Some(Ok(line)) => {
                        let line = String::from_utf8_lossy(&line);
                        on_line(line.trim_end_matches('\r').to_string());
                    },
                    Some(Err(err)) => {
                        inner.connection_lost(id, Some(codec_error(err)));
                        break 'mainloop;
                    },
                    None => {
                        inner.connection_lost(id, None);
                        break 'mainloop;
                    },
                }
            }
        });
        Ok(())
    }

    /// Closes the connection if there is one. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let previous = {
            let mut connection = lock(&self.inner.connection);
            self.inner.attempt.fetch_add(1, Ordering::SeqCst);
            self.inner.state.release(TransportKind::Classic);
            self.inner.state.publish_classic(ConnectionState::Disconnected);
            connection.take()
        };

        if let Some(connection) = previous {
            info!("Disconnecting (Classic) from {}", connection.address);
            connection.cancel.cancel();
        }
    }

    fn take_reader(&self) -> Result<(u64, ReadHalf<C::Stream>, CancellationToken), LinkError> {
        let mut guard = lock(&self.inner.connection);
        let connection = guard.as_mut().ok_or(LinkError::NotConnected(TransportKind::Classic))?;
        let reader = connection.reader.take().ok_or(LinkError::ReceiverBusy)?;

        Ok((connection.id, reader, connection.cancel.clone()))
    }
}

impl<C: ClassicConnector> Inner<C> {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
            && self.state.active_transport() == Some(TransportKind::Classic)
    }

    /// Installs a freshly opened stream, replacing any previous connection, and publishes
    /// `Connected` before a concurrent disconnect can observe the new connection.
    fn attach(&self, attempt: u64, address: String, stream: C::Stream) -> bool {
        let mut connection = lock(&self.connection);
        if !self.is_current(attempt) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.workers.child_token();
        let (reader, writer) = tokio::io::split(stream);
        let (sender, outgoing) = mpsc::unbounded_channel();
        self.spawn_writer(writer, outgoing, cancel.clone());

        let previous = connection.replace(Connection {
            id,
            address,
            writer: sender,
            reader: Some(reader),
            cancel,
        });
        if let Some(previous) = previous {
            info!("Replacing Classic connection to {}", previous.address);
            previous.cancel.cancel();
        }
        self.state.publish_classic(ConnectionState::Connected);
        true
    }

    /// A failed attempt that was already superseded leaves the state alone.
    fn fail(&self, attempt: u64, address: &str, err: LinkError) {
        let _connection = lock(&self.connection);
        if !self.is_current(attempt) {
            info!("Abandoned Classic connection to {} failed: {}", address, err);
            return;
        }

        warn!("Classic connection to {} failed: {}", address, err);
        self.state.release(TransportKind::Classic);
        self.state.publish_classic(ConnectionState::Failed(Failure::from(&err)));
    }

    fn spawn_writer(&self, mut writer: WriteHalf<C::Stream>, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>, cancel: CancellationToken) {
        let state = self.state.clone();

        self.workers.spawn("classic-writer", async move {
            'mainloop: loop {
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    bytes = outgoing.recv() => bytes,
                };
                let Some(bytes) = bytes else { break 'mainloop };

                let result = match writer.write_all(&bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                };

                match result {
                    Ok(()) => {
                        debug!("Sent {} bytes (Classic)", bytes.len());
                        state.publish_activity(Activity::DataSent(TransportKind::Classic));
                    },
                    Err(err) => {
                        let err = LinkError::from(err);
                        warn!("Classic write failed: {}", err);
                        state.publish_activity(Activity::SendFailed(TransportKind::Classic, Failure::from(&err)));
                    },
                }
            }
        });
    }

    /// The stream with `id` ended. Stale ids (already replaced or disconnected) are ignored.
    fn connection_lost(&self, id: u64, error: Option<LinkError>) {
        let lost = {
            let mut connection = lock(&self.connection);
            let lost = match connection.as_ref() {
                Some(current) if current.id == id => connection.take(),
                _ => None,
            };
            if lost.is_some() {
                self.state.release(TransportKind::Classic);
                self.state.publish_classic(ConnectionState::Disconnected);
            }
            lost
        };
        let Some(lost) = lost else { return };
        lost.cancel.cancel();

        match error {
            Some(err) => {
                warn!("Classic connection to {} lost: {}", lost.address, err);
                self.state.publish_activity(Activity::ReceiveFailed(TransportKind::Classic, Failure::from(&err)));
            },
            None => info!("Classic stream from {} closed by the device", lost.address),
        }
    }

    fn remember(&self, address: String) {
        let settings = self.settings.clone();

        self.workers.spawn("remember-device", async move {
            if let Err(err) = settings.set(SettingsField::LastConnectedDevice(Some(address))).await {
                warn!("Failed to remember the last connected device: {}", err);
            }
        });
    }
}

fn codec_error(err: AnyDelimiterCodecError) -> LinkError {
    match err {
        AnyDelimiterCodecError::Io(source) => LinkError::Io { source },
        other => LinkError::Io { source: io::Error::new(io::ErrorKind::InvalidData, other.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    use crate::config::store::MemorySettings;
    use crate::device::constants::SERIAL_PORT_SERVICE;
    use crate::error::FailureKind;
    use crate::transport::fake::{wait_until, FakeConnector};

    const ADDRESS: &str = "98:D3:31:F5:1A:2B";

    fn session(connector: &FakeConnector) -> (ClassicSession<FakeConnector>, Arc<LinkState>, Arc<MemorySettings>) {
        let state = Arc::new(LinkState::new());
        let settings = Arc::new(MemorySettings::default());
        let session = ClassicSession::new(connector.clone(), settings.clone(), state.clone(), Workers::new());
        (session, state, settings)
    }

    async fn connect(session: &ClassicSession<FakeConnector>) -> bool {
        let (sender, receiver) = oneshot::channel();
        session.connect(ADDRESS, SERIAL_PORT_SERVICE, move |connected| {
            let _ = sender.send(connected);
        });
        receiver.await.unwrap()
    }

    #[tokio::test]
    async fn connect_publishes_connected_and_remembers_device() {
        let connector = FakeConnector::new();
        let _remote = connector.plug(ADDRESS);
        let (session, state, settings) = session(&connector);
        let mut remembered = settings.subscribe();

        assert!(connect(&session).await);
        assert_eq!(state.classic_state(), ConnectionState::Connected);
        assert!(state.is_connected());
        assert_eq!(session.connected_address().as_deref(), Some(ADDRESS));
        assert_eq!(connector.attempts(), vec![(ADDRESS.to_string(), SERIAL_PORT_SERVICE)]);

        let settings = wait_until(&mut remembered, |settings| settings.last_connected_device.is_some()).await;
        assert_eq!(settings.last_connected_device.as_deref(), Some(ADDRESS));
    }

    #[tokio::test]
    async fn unreachable_device_fails_once() {
        let connector = FakeConnector::new();
        let (session, state, settings) = session(&connector);
        let calls = Arc::new(AtomicUsize::new(0));

        let (sender, receiver) = oneshot::channel();
        let counter = calls.clone();
        session.connect(ADDRESS, SERIAL_PORT_SERVICE, move |connected| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = sender.send(connected);
        });

        assert!(!receiver.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match state.classic_state() {
            ConnectionState::Failed(failure) => assert_eq!(failure.kind, FailureKind::Transient),
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(settings.get().last_connected_device, None);
        assert_eq!(state.active_transport(), None);
    }

    #[tokio::test]
    async fn denied_channel_is_a_permission_failure() {
        let connector = FakeConnector::new();
        connector.deny();
        let (session, state, _) = session(&connector);

        assert!(!connect(&session).await);
        match state.classic_state() {
            ConnectionState::Failed(failure) => assert_eq!(failure.kind, FailureKind::PermissionDenied),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let connector = FakeConnector::new();
        let _remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);

        session.disconnect();
        assert_eq!(state.classic_state(), ConnectionState::Disconnected);

        assert!(connect(&session).await);
        session.disconnect();
        session.disconnect();
        assert_eq!(state.classic_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(!state.is_connected());
    }

    #[tokio::test]
    async fn send_reaches_the_device() {
        let connector = FakeConnector::new();
        let mut remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);
        assert!(connect(&session).await);

        let mut activity = state.subscribe_activity();
        session.send(b"M1-01: Hello~".to_vec()).unwrap();

        let mut buffer = [0u8; 13];
        remote.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"M1-01: Hello~");
        wait_until(&mut activity, |activity| *activity == Activity::DataSent(TransportKind::Classic)).await;
    }

    #[tokio::test]
    async fn send_without_connection_fails() {
        let connector = FakeConnector::new();
        let (session, state, _) = session(&connector);

        let result = session.send(b"hello".to_vec());
        assert!(matches!(result, Err(LinkError::NotConnected(TransportKind::Classic))));
        assert!(matches!(state.activity(), Activity::SendFailed(TransportKind::Classic, _)));
    }

    #[tokio::test]
    async fn lines_are_framed_and_receiver_is_exclusive() {
        let connector = FakeConnector::new();
        let mut remote = connector.plug(ADDRESS);
        let (session, _, _) = session(&connector);
        assert!(connect(&session).await);

        let (sender, mut lines) = mpsc::unbounded_channel();
        session.read_lines(move |line| {
            let _ = sender.send(line);
        }).unwrap();
        assert!(matches!(session.read_lines(|_| {}), Err(LinkError::ReceiverBusy)));
        assert!(matches!(session.receive(|_| {}), Err(LinkError::ReceiverBusy)));

        remote.write_all(b"F1: 12 F2: 3\r\nF1:").await.unwrap();
        remote.write_all(b" 7\n").await.unwrap();

        assert_eq!(lines.recv().await.unwrap(), "F1: 12 F2: 3");
        assert_eq!(lines.recv().await.unwrap(), "F1: 7");
    }

    #[tokio::test]
    async fn remote_close_disconnects() {
        let connector = FakeConnector::new();
        let mut remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);
        assert!(connect(&session).await);

        let (sender, mut chunks) = mpsc::unbounded_channel();
        session.receive(move |chunk| {
            let _ = sender.send(chunk.to_vec());
        }).unwrap();

        remote.write_all(b"Assignment:Successful").await.unwrap();
        assert_eq!(chunks.recv().await.unwrap(), b"Assignment:Successful".to_vec());

        let mut classic = state.subscribe_classic();
        drop(remote);
        wait_until(&mut classic, |state| *state == ConnectionState::Disconnected).await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn disconnect_during_connect_abandons_the_attempt() {
        let connector = FakeConnector::new();
        let _remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);

        let (sender, receiver) = oneshot::channel();
        session.connect(ADDRESS, SERIAL_PORT_SERVICE, move |connected| {
            let _ = sender.send(connected);
        });
        session.disconnect();

        assert!(!receiver.await.unwrap());
        assert_eq!(state.classic_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(!state.is_connected());
        assert_eq!(state.active_transport(), None);
    }

    #[tokio::test]
    async fn abandoned_attempt_that_fails_stays_disconnected() {
        let connector = FakeConnector::new();
        let (session, state, _) = session(&connector);
        let mut classic = state.subscribe_classic();

        let (sender, receiver) = oneshot::channel();
        session.connect(ADDRESS, SERIAL_PORT_SERVICE, move |connected| {
            let _ = sender.send(connected);
        });
        session.disconnect();
        classic.borrow_and_update();

        assert!(!receiver.await.unwrap());
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(state.classic_state(), ConnectionState::Disconnected);
        assert!(!classic.has_changed().unwrap());
    }

    #[tokio::test]
    async fn connect_is_refused_while_ble_holds_the_link() {
        let connector = FakeConnector::new();
        let _remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);
        state.claim(TransportKind::Ble).unwrap();

        assert!(!connect(&session).await);
        match state.classic_state() {
            ConnectionState::Failed(failure) => assert!(failure.message.contains("BLE")),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(connector.attempts().is_empty());
        assert_eq!(state.active_transport(), Some(TransportKind::Ble));
    }

    #[tokio::test]
    async fn disconnect_releases_the_link() {
        let connector = FakeConnector::new();
        let _remote = connector.plug(ADDRESS);
        let (session, state, _) = session(&connector);

        assert!(connect(&session).await);
        assert_eq!(state.active_transport(), Some(TransportKind::Classic));
        assert!(matches!(state.claim(TransportKind::Ble), Err(LinkError::AlreadyConnected(TransportKind::Classic))));

        session.disconnect();
        assert_eq!(state.active_transport(), None);
        state.claim(TransportKind::Ble).unwrap();
    }
}
