//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! The server runs one worker per thread, each with its own
//! `SO_REUSEPORT` listener, so the kernel spreads connections across
//! workers and no state is shared between them. The client runs a single
//! connection on a dedicated network thread and publishes its outcome
//! through a [`Completion`] the caller blocks on.

use crate::config::Config;
use crate::runtime::connection::{MuxConnection, Role};
use crate::session::{
    system_clock, ClientOutcome, ClientSession, Completion, ServerSession, ServerSettings,
};
use crate::transport::{Transport, TransportError, TransportEvent};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const CLIENT_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Per-worker connection state.
struct ServerConnection {
    mux: MuxConnection<TcpStream>,
    session: ServerSession,
    interest: Interest,
    peer: SocketAddr,
}

/// Client network thread parameters.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub window: u32,
    pub connect_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

/// Run the server until the process is stopped.
pub fn run_server(config: &Config) -> io::Result<()> {
    let num_workers = config
        .workers
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus);
    let addr = config.socket_addr()?;

    info!(
        workers = num_workers,
        addr = %addr,
        amplification = config.amplification,
        chunk_size = config.chunk_size,
        stream_window = config.stream_window,
        "Starting server"
    );

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        // Bind up front so an address in use fails the whole run.
        let listener = create_listener(addr)?;
        let settings = config.server_settings();
        let window = config.stream_window;

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = serve(worker_id, listener, settings, window) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all workers
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Run one benchmark and wait for its outcome.
pub fn run_client(config: &Config) -> io::Result<ClientOutcome> {
    let addr = config.socket_addr()?;
    let options = ClientOptions {
        window: config.stream_window,
        connect_timeout: config.connect_timeout(),
        run_timeout: config.run_timeout(),
    };

    info!(
        addr = %addr,
        bytes = config.bytes,
        amplification = config.amplification,
        "Starting client"
    );

    let (completion, rx) = Completion::channel();
    let session = ClientSession::new(config.client_settings(), completion, system_clock());
    let handle = spawn_client(addr, session, options)?;

    let outcome = rx.blocking_recv();
    if handle.join().is_err() {
        error!("Client thread panicked");
    }
    outcome.map_err(|_| io::Error::new(io::ErrorKind::Other, "client finished without an outcome"))
}

/// Start the client network thread.
pub fn spawn_client(
    addr: SocketAddr,
    mut session: ClientSession,
    options: ClientOptions,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bench-client".to_string())
        .spawn(move || {
            if let Err(e) = client_loop(addr, &mut session, &options) {
                session.abort(e.into());
            }
        })
}

fn client_loop(
    addr: SocketAddr,
    session: &mut ClientSession,
    options: &ClientOptions,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let stream = TcpStream::connect(addr)?;
    let mut mux = MuxConnection::new(stream, Role::Client, options.window);
    let mut interest = Interest::READABLE | Interest::WRITABLE;
    poll.registry()
        .register(mux.socket_mut(), CLIENT_TOKEN, interest)?;

    let started = Instant::now();
    let connect_deadline = started + options.connect_timeout;
    let run_deadline = options.run_timeout.map(|t| started + t);

    while !session.is_finished() {
        let deadline = if mux.is_established() {
            run_deadline
        } else {
            Some(run_deadline.map_or(connect_deadline, |d| d.min(connect_deadline)))
        };
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            if !mux.is_established() && !mux.is_closed() {
                match connect_result(mux.socket()) {
                    Ok(true) => {
                        mux.establish();
                        info!(addr = %addr, "Connected");
                        session.start(&mut mux);
                    }
                    Ok(false) => continue,
                    Err(e) => mux.fail(e.into()),
                }
            }
            if mux.is_established() && (event.is_readable() || event.is_read_closed()) {
                mux.read_ready();
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            if mux.is_established() {
                warn!("Run timed out");
            } else {
                warn!(addr = %addr, "Connect timed out");
            }
            mux.fail(TransportError::TimedOut);
        }

        drive(&mut mux, |event, mux| session.handle(event, mux));

        if !session.is_finished() {
            update_interest(&mut poll, CLIENT_TOKEN, &mut mux, &mut interest)?;
        }
    }

    mux.close();
    mux.flush();
    let _ = poll.registry().deregister(mux.socket_mut());
    debug!("Client loop finished");
    Ok(())
}

/// Whether a non-blocking connect has completed.
fn connect_result(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// Serve connections accepted on `listener` forever.
pub fn serve(
    worker_id: usize,
    listener: std::net::TcpListener,
    settings: ServerSettings,
    window: u32,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut connections: Slab<ServerConnection> = Slab::new();

    info!(worker = worker_id, "Worker started");

    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        &settings,
                        window,
                        worker_id,
                    )?;
                }
                Token(conn_id) => {
                    if let Err(e) = handle_connection_event(conn_id, event, &mut poll, &mut connections)
                    {
                        debug!(conn_id, error = %e, "Connection error");
                        close_connection(&mut poll, &mut connections, conn_id);
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<ServerConnection>,
    settings: &ServerSettings,
    window: u32,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }

                let mut mux = MuxConnection::new(stream, Role::Server, window);
                mux.establish();

                let entry = connections.vacant_entry();
                let conn_id = entry.key();
                let conn = entry.insert(ServerConnection {
                    mux,
                    session: ServerSession::new(settings.clone(), system_clock()),
                    interest: Interest::READABLE,
                    peer,
                });
                poll.registry()
                    .register(conn.mux.socket_mut(), Token(conn_id), conn.interest)?;

                info!(worker = worker_id, conn_id, peer = %peer, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut Slab<ServerConnection>,
) -> io::Result<()> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(());
    };

    if event.is_readable() || event.is_read_closed() || event.is_error() {
        conn.mux.read_ready();
    }

    let ServerConnection {
        mux,
        session,
        interest,
        ..
    } = conn;
    drive(mux, |event, mux| session.handle(event, mux));

    if session.is_finished() || mux.is_closed() {
        close_connection(poll, connections, conn_id);
        return Ok(());
    }

    update_interest(poll, Token(conn_id), mux, interest)
}

/// Hand every pending transport event to the session and flush what it
/// wrote, until the connection has nothing more to report.
fn drive<F>(mux: &mut MuxConnection<TcpStream>, mut handle: F)
where
    F: FnMut(TransportEvent, &mut MuxConnection<TcpStream>),
{
    loop {
        mux.flush();
        let events = mux.take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            handle(event, mux);
        }
    }
}

/// Watch for writability only while frames are queued.
fn update_interest(
    poll: &mut Poll,
    token: Token,
    mux: &mut MuxConnection<TcpStream>,
    current: &mut Interest,
) -> io::Result<()> {
    let wanted = if mux.wants_write() || !mux.is_established() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if wanted != *current {
        poll.registry().reregister(mux.socket_mut(), token, wanted)?;
        *current = wanted;
    }
    Ok(())
}

fn close_connection(poll: &mut Poll, connections: &mut Slab<ServerConnection>, conn_id: usize) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(conn.mux.socket_mut());
        info!(
            conn_id,
            peer = %conn.peer,
            replies = conn.session.replies_finished(),
            "Connection closed"
        );
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
pub fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
