//! Many-to-many bridge between host serial sockets and console clients.
//!
//! One session per VM holds the byte stream to the host. Output bytes fan
//! out to every attached client over a broadcast channel; input from any
//! client is forwarded to the stream in arrival order (last-writer-wins,
//! like a physical TTY). Slow clients are detected by broadcast lag and
//! must be disconnected by the endpoint. A session whose last client left
//! stays open for a grace period, then closes the underlying stream; no
//! scrollback is kept.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vdc_api_types::Ulid;

/// Grace period before an idle (client-less) session is torn down.
pub const IDLE_CLOSE: Duration = Duration::from_secs(30);

/// Output fan-out buffer: 16 chunks of at most 4 KiB, i.e. 64 KiB per
/// client before it counts as too slow.
const OUTPUT_CHANNEL_CHUNKS: usize = 16;
const OUTPUT_CHUNK: usize = 4096;

/// Byte-duplex stream to a host serial socket.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub type ByteStream = Box<dyn Duplex>;

struct Session {
    vm: Ulid,
    output: broadcast::Sender<Bytes>,
    input: mpsc::Sender<Vec<u8>>,
    clients: AtomicUsize,
    stop: CancellationToken,
}

/// What a connected client holds: receive fan-out, send input, and a guard
/// whose drop starts the idle countdown.
pub struct ClientHandle {
    pub output: broadcast::Receiver<Bytes>,
    input: mpsc::Sender<Vec<u8>>,
    session: Arc<Session>,
    hub: ConsoleHub,
}

impl ClientHandle {
    /// Forward client input to the serial socket.
    pub async fn send_input(&self, data: Vec<u8>) -> Result<(), anyhow::Error> {
        self.input
            .send(data)
            .await
            .map_err(|_| anyhow::format_err!("console session closed"))
    }

    pub fn vm(&self) -> Ulid {
        self.session.vm
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let remaining = self.session.clients.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.hub.schedule_idle_close(self.session.clone());
        }
    }
}

#[derive(Clone, Default)]
pub struct ConsoleHub {
    sessions: Arc<RwLock<HashMap<Ulid, Arc<Session>>>>,
    /// Serializes session creation per hub; stream opening happens outside.
    create: Arc<Mutex<()>>,
}

impl ConsoleHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to an existing session, if the VM has one.
    pub fn attach(&self, vm: Ulid) -> Option<ClientHandle> {
        let sessions = self.sessions.read().unwrap();
        let session = sessions.get(&vm)?;
        if session.stop.is_cancelled() {
            return None;
        }
        session.clients.fetch_add(1, Ordering::AcqRel);
        Some(ClientHandle {
            output: session.output.subscribe(),
            input: session.input.clone(),
            session: session.clone(),
            hub: self.clone(),
        })
    }

    /// Register a freshly opened stream as the VM's session and attach.
    /// Loses against a session that appeared concurrently: the new stream
    /// is dropped and the existing session is joined instead.
    pub fn open(&self, vm: Ulid, stream: ByteStream) -> ClientHandle {
        let _create = self.create.lock().unwrap();
        if let Some(handle) = self.attach(vm) {
            return handle;
        }

        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CHUNKS);
        let (input_tx, input_rx) = mpsc::channel(64);
        let session = Arc::new(Session {
            vm,
            output: output.clone(),
            input: input_tx.clone(),
            clients: AtomicUsize::new(1),
            stop: CancellationToken::new(),
        });

        self.sessions
            .write()
            .unwrap()
            .insert(vm, session.clone());

        tokio::spawn(pump(
            stream,
            output,
            input_rx,
            session.stop.clone(),
            self.clone(),
            vm,
        ));
        info!(%vm, "console session opened");

        ClientHandle {
            output: session.output.subscribe(),
            input: input_tx,
            session,
            hub: self.clone(),
        }
    }

    /// Tear down a VM's session immediately (VM stopped or terminated).
    pub fn close(&self, vm: Ulid) {
        if let Some(session) = self.sessions.write().unwrap().remove(&vm) {
            session.stop.cancel();
            info!(%vm, "console session closed");
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    fn schedule_idle_close(&self, session: Arc<Session>) {
        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(IDLE_CLOSE).await;
            if session.clients.load(Ordering::Acquire) == 0 && !session.stop.is_cancelled() {
                debug!(vm = %session.vm, "closing idle console session");
                hub.close(session.vm);
            }
        });
    }

    fn remove_if_current(&self, vm: Ulid, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(current) = sessions.get(&vm) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&vm);
            }
        }
    }
}

async fn pump(
    mut stream: ByteStream,
    output: broadcast::Sender<Bytes>,
    mut input: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
    hub: ConsoleHub,
    vm: Ulid,
) {
    let session_ref = {
        let sessions = hub.sessions.read().unwrap();
        sessions.get(&vm).cloned()
    };

    let mut buf = [0u8; OUTPUT_CHUNK];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(%vm, "console stream reached EOF");
                    break;
                }
                Ok(n) => {
                    // no receivers just means nobody is watching right now
                    let _ = output.send(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(err) => {
                    warn!(%vm, "console stream read failed: {err}");
                    break;
                }
            },
            data = input.recv() => match data {
                Some(data) => {
                    if let Err(err) = stream.write_all(&data).await {
                        warn!(%vm, "console stream write failed: {err}");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    stop.cancel();
    if let Some(session) = session_ref {
        hub.remove_if_current(vm, &session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream() -> (ByteStream, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        (Box::new(ours), theirs)
    }

    #[tokio::test]
    async fn output_fans_out_to_all_clients() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, mut host_side) = test_stream();

        let mut a = hub.open(vm, stream);
        let mut b = hub.attach(vm).expect("session exists");

        host_side.write_all(b"login: ").await.unwrap();

        assert_eq!(a.output.recv().await.unwrap().as_ref(), b"login: ");
        assert_eq!(b.output.recv().await.unwrap().as_ref(), b"login: ");
    }

    #[tokio::test]
    async fn input_from_any_client_reaches_the_host() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, mut host_side) = test_stream();

        let a = hub.open(vm, stream);
        let b = hub.attach(vm).unwrap();

        a.send_input(b"ls\n".to_vec()).await.unwrap();
        b.send_input(b"pwd\n".to_vec()).await.unwrap();

        let mut buf = [0u8; 7];
        host_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\npwd\n");
    }

    #[tokio::test]
    async fn disconnecting_one_client_leaves_the_other() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, mut host_side) = test_stream();

        let mut a = hub.open(vm, stream);
        let b = hub.attach(vm).unwrap();
        drop(b);

        host_side.write_all(b"x").await.unwrap();
        assert_eq!(a.output.recv().await.unwrap().as_ref(), b"x");
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn close_tears_down_the_session() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, _host_side) = test_stream();

        let handle = hub.open(vm, stream);
        hub.close(vm);
        assert_eq!(hub.session_count(), 0);
        assert!(handle.send_input(b"x".to_vec()).await.is_err() || hub.attach(vm).is_none());
    }

    #[tokio::test]
    async fn host_eof_removes_the_session() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, host_side) = test_stream();

        let _handle = hub.open(vm, stream);
        drop(host_side);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn slow_clients_observe_lag() {
        let hub = ConsoleHub::new();
        let vm = Ulid::generate();
        let (stream, mut host_side) = test_stream();

        let mut slow = hub.open(vm, stream);

        // overflow the 16-chunk fan-out buffer while the client reads nothing
        for _ in 0..64 {
            host_side.write_all(&[0u8; OUTPUT_CHUNK]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        match slow.output.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => (),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
