use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tether::{
    stack::{TcpConfig, TcpServer, TcpStack},
    ConnectionObserver, ConnectionRef,
};

struct Echo {
    disconnects: AtomicU32,
}

impl ConnectionObserver<TcpStack> for Echo {
    fn on_data(&self, conn: &ConnectionRef<TcpStack>, data: &[u8]) {
        // two back-to-back sends: the second one may land in the backlog
        conn.send(data).unwrap();
        conn.send(b"+").unwrap();
    }

    fn on_disconnected(&self, _conn: &ConnectionRef<TcpStack>) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

type Sessions = Arc<Mutex<Vec<ConnectionRef<TcpStack>>>>;

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap()
}

fn settle() {
    thread::sleep(Duration::from_millis(300));
}

fn start_echo_server(
    runtime: &tokio::runtime::Runtime,
    config: TcpConfig,
) -> (Arc<TcpServer>, Arc<Echo>, Sessions) {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).try_init();

    let server = runtime.block_on(TcpServer::bind("127.0.0.1:0", config)).unwrap();
    let echo = Arc::new(Echo { disconnects: AtomicU32::new(0) });
    let sessions: Sessions = Arc::new(Mutex::new(Vec::new()));

    let _guard = runtime.enter();
    {
        let echo = Arc::clone(&echo);
        let sessions = Arc::clone(&sessions);
        Arc::clone(&server).serve(move |conn, _peer| {
            let observer: Arc<dyn ConnectionObserver<TcpStack>> = echo.clone();
            conn.add_observer(&observer);
            sessions.lock().unwrap().push(conn);
        });
    }

    (server, echo, sessions)
}

#[test]
fn echo_roundtrip() {
    let runtime = rt();
    let (server, echo, _sessions) = start_echo_server(&runtime, TcpConfig::default());

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut buf = [0u8; 6];
    client.write_all(b"hello").unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello+");

    client.write_all(b"world").unwrap();
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"world+");

    drop(client);
    settle();
    assert_eq!(echo.disconnects.load(Ordering::Relaxed), 1);
}

#[test]
fn forced_disconnect_reaches_the_peer() {
    let runtime = rt();
    let (server, echo, sessions) = start_echo_server(&runtime, TcpConfig::default());

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    settle();

    let conn = sessions.lock().unwrap().pop().unwrap();
    conn.disconnect(true);

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    settle();
    assert_eq!(echo.disconnects.load(Ordering::Relaxed), 1);
    assert!(!conn.is_open());
}

#[test]
fn idle_timeout_closes_the_connection() {
    let runtime = rt();
    let config = TcpConfig { idle_timeout: Some(Duration::from_millis(200)) };
    let (server, echo, _sessions) = start_echo_server(&runtime, config);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    settle();
    assert_eq!(echo.disconnects.load(Ordering::Relaxed), 1);
}
