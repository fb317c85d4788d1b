use super::{Stack, StackError};
use crate::{
    connection::{Connection, ConnectionRef},
    registry::{ConnectionOwner, Registry},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, ToSocketAddrs,
    },
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
};
use tracing::{debug, trace, warn};

const READ_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u32);

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Idle-disconnect applied to every accepted connection; a connection's
    /// `set_timeout` overrides it for that connection only.
    pub idle_timeout: Option<Duration>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { idle_timeout: Some(Duration::from_secs(30)) }
    }
}

enum Command {
    Send(Bytes),
    Shutdown,
}

struct Socket {
    commands: UnboundedSender<Command>,
    idle: watch::Sender<Option<Duration>>,
}

/// Tokio-backed stack: one reader and one writer task per accepted socket.
/// The writer acknowledges each completed write through the registry's sent
/// entry point; the reader dispatches received/failed/disconnected.
pub struct TcpStack {
    sockets: Mutex<HashMap<SocketId, Socket>>,
    next_id: AtomicU32,
}

impl TcpStack {
    fn new() -> Arc<Self> {
        Arc::new(Self { sockets: Mutex::new(HashMap::new()), next_id: AtomicU32::new(0) })
    }

    fn drop_socket(&self, id: SocketId) {
        self.sockets.lock().unwrap().remove(&id);
    }
}

impl Stack for TcpStack {
    type Raw = SocketId;

    fn send(&self, raw: SocketId, data: &[u8]) -> Result<(), StackError> {
        let sockets = self.sockets.lock().unwrap();
        let socket = sockets.get(&raw).ok_or(StackError::Disconnected)?;
        socket
            .commands
            .send(Command::Send(Bytes::copy_from_slice(data)))
            .map_err(|_| StackError::Disconnected)
    }

    fn disconnect(&self, raw: SocketId) {
        if let Some(socket) = self.sockets.lock().unwrap().get(&raw) {
            let _ = socket.commands.send(Command::Shutdown);
        }
    }

    fn set_timeout(&self, raw: SocketId, timeout: Duration) {
        if let Some(socket) = self.sockets.lock().unwrap().get(&raw) {
            let _ = socket.idle.send(Some(timeout));
        }
    }
}

/// Accepting side: owns the listener, the stack and the registry, and wraps
/// every accepted socket in a [`Connection`].
pub struct TcpServer {
    stack: Arc<TcpStack>,
    registry: Arc<Registry<TcpStack>>,
    config: TcpConfig,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl TcpServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: TcpConfig) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(Self {
            stack: TcpStack::new(),
            registry: Arc::new(Registry::new()),
            config,
            listener: Mutex::new(Some(listener)),
            local_addr,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stack(&self) -> &Arc<TcpStack> {
        &self.stack
    }

    pub fn registry(&self) -> &Arc<Registry<TcpStack>> {
        &self.registry
    }

    /// Accept connections until the task is aborted. Each accepted socket is
    /// wrapped and handed to `accept` together with its birth reference; an
    /// `accept` that drops the reference without retaining the connection
    /// closes it again.
    pub fn serve<F>(self: Arc<Self>, mut accept: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(ConnectionRef<TcpStack>, SocketAddr) + Send + 'static,
    {
        let listener = self.listener.lock().unwrap().take().expect("serve called twice");

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let conn = Self::adopt(&self, stream);
                debug!(id = %conn.id(), %peer, "accepted");
                accept(conn, peer);
            }
        })
    }

    fn adopt(server: &Arc<Self>, stream: TcpStream) -> ConnectionRef<TcpStack> {
        let id = SocketId(server.stack.next_id.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = stream.into_split();
        let (commands, commands_recv) = mpsc::unbounded_channel();
        let (idle, idle_recv) = watch::channel(server.config.idle_timeout);
        let (stop, stop_recv) = watch::channel(false);

        server.stack.sockets.lock().unwrap().insert(id, Socket { commands, idle });

        let server_dyn: Arc<dyn ConnectionOwner> = server.clone();
        let owner: Weak<dyn ConnectionOwner> = Arc::downgrade(&server_dyn);
        let conn = Connection::open(Arc::clone(&server.stack), id, Some(owner), &server.registry);

        tokio::spawn(write_loop(id, write_half, Arc::clone(&server.registry), commands_recv, stop));
        tokio::spawn(read_loop(
            id,
            read_half,
            Arc::clone(&server.stack),
            Arc::clone(&server.registry),
            idle_recv,
            stop_recv,
        ));

        server.registry.connected(id);
        conn
    }
}

impl ConnectionOwner for TcpServer {
    fn repair_bindings(&self) {
        self.registry.rebind_all();
    }
}

async fn write_loop(
    id: SocketId,
    mut stream: OwnedWriteHalf,
    registry: Arc<Registry<TcpStack>>,
    mut commands: UnboundedReceiver<Command>,
    stop: watch::Sender<bool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Send(data) => match stream.write_all(&data).await {
                Ok(()) => registry.sent(id),
                Err(err) => {
                    warn!(socket = id.0, %err, "write failed");
                    break;
                }
            },
            Command::Shutdown => break,
        }
    }
    let _ = stream.shutdown().await;
    let _ = stop.send(true);
}

async fn read_loop(
    id: SocketId,
    mut stream: OwnedReadHalf,
    stack: Arc<TcpStack>,
    registry: Arc<Registry<TcpStack>>,
    mut idle: watch::Receiver<Option<Duration>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut failure = false;
    loop {
        let timeout = *idle.borrow();
        tokio::select! {
            _ = stop.changed() => break,
            changed = idle.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            read = read_with_idle(&mut stream, &mut buf, timeout) => match read {
                Ok(0) => {
                    trace!(socket = id.0, "peer closed");
                    break;
                }
                Ok(n) => registry.received(id, &buf[..n]),
                Err(err) if err.kind() == ErrorKind::TimedOut => {
                    debug!(socket = id.0, "idle timeout");
                    break;
                }
                Err(err) => {
                    warn!(socket = id.0, %err, "read failed");
                    failure = true;
                    break;
                }
            },
        }
    }
    stack.drop_socket(id);
    if failure {
        registry.failed(id);
    }
    registry.disconnected(id);
}

async fn read_with_idle(
    stream: &mut OwnedReadHalf,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<usize> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(read) => read,
            Err(_) => Err(io::Error::new(ErrorKind::TimedOut, "idle timeout")),
        },
        None => stream.read(buf).await,
    }
}
