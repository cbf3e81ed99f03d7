use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::bound::LoopBound;
use crate::buffer::Buffer;
use crate::connection::{
    CloseCallback, ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::loop_pool::LoopPool;
use crate::loop_thread::ThreadInitCallback;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// A multi-reactor TCP server.
///
/// The server's loop (the "main" loop, the one passed to
/// [`new`](TcpServer::new)) accepts connections and owns the name map;
/// [`set_thread_num`](TcpServer::set_thread_num) worker loops carry the
/// per-connection I/O, assigned round-robin at accept time.
///
/// Configure callbacks before [`start`](TcpServer::start); the server and
/// its setters live on the main loop's thread.
///
/// # Examples
///
/// ```no_run
/// use evio::{EventLoop, TcpServer};
/// use std::sync::Arc;
///
/// let event_loop = EventLoop::new().unwrap();
/// let addr = "127.0.0.1:7000".parse().unwrap();
/// let server = TcpServer::new(&event_loop, addr, "echo").unwrap();
/// server.set_thread_num(2);
/// server.set_message_callback(Arc::new(|conn, buf, _ts| {
///     let msg = buf.retrieve_all_as_string();
///     conn.send(msg.as_bytes());
/// }));
/// server.start().unwrap();
/// event_loop.run();
/// ```
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

struct ServerInner {
    event_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: LoopBound<LoopPool>,
    callbacks: LoopBound<Callbacks>,
    connections: LoopBound<HashMap<String, TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    self_weak: Weak<ServerInner>,
}

impl TcpServer {
    /// Binds a listener on `listen_addr` and wires it into `event_loop`.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(Arc::clone(event_loop), &listen_addr)?;
        let ip_port = acceptor.listen_addr()?.to_string();
        let owner = event_loop.thread_id();

        let inner = Arc::new_cyclic(|self_weak: &Weak<ServerInner>| ServerInner {
            event_loop: Arc::clone(event_loop),
            name: name.to_owned(),
            ip_port,
            acceptor,
            pool: LoopBound::new(owner, LoopPool::new(Arc::clone(event_loop), name)),
            callbacks: LoopBound::new(
                owner,
                Callbacks {
                    connection: Arc::new(default_connection_callback),
                    message: Arc::new(default_message_callback),
                    write_complete: None,
                    thread_init: None,
                },
            ),
            connections: LoopBound::new(owner, HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(socket, peer_addr);
                }
            }));

        Ok(TcpServer { inner })
    }

    /// The address the listener is bound to, kernel-chosen port included.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.listen_addr()
    }

    /// Number of worker loops; zero keeps all I/O on the main loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.borrow_mut().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.inner.callbacks.borrow_mut().connection = callback;
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.inner.callbacks.borrow_mut().message = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.inner.callbacks.borrow_mut().write_complete = Some(callback);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        self.inner.callbacks.borrow_mut().thread_init = Some(callback);
    }

    /// Starts the worker pool and the listener. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let thread_init = self.inner.callbacks.borrow().thread_init.clone();
        self.inner.pool.borrow_mut().start(thread_init)?;

        assert!(!self.inner.acceptor.listening());
        let acceptor = Arc::clone(&self.inner.acceptor);
        self.inner.event_loop.run_in_loop(move || {
            if let Err(err) = acceptor.listen() {
                panic!("TcpServer failed to listen: {}", err);
            }
        });
        Ok(())
    }
}

impl ServerInner {
    /// Accept-path continuation, on the main loop.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.pool.borrow_mut().next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{}", self.name, self.ip_port, id);

        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("getsockname for [{}]: {}", name, err);
                return;
            }
        };

        let close_callback: CloseCallback = {
            let weak = self.self_weak.clone();
            Arc::new(move |conn: &TcpConnectionPtr| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_connection(conn);
                }
            })
        };

        let callbacks = self.callbacks.borrow();
        let conn = TcpConnection::new(
            Arc::clone(&io_loop),
            name.clone(),
            socket,
            local_addr,
            peer_addr,
            Arc::clone(&callbacks.connection),
            Arc::clone(&callbacks.message),
            callbacks.write_complete.clone(),
            close_callback,
        );
        drop(callbacks);

        self.connections.borrow_mut().insert(name, Arc::clone(&conn));
        io_loop.run_in_loop(move || conn.establish());
    }

    /// Runs on the connection's loop; hops to the main loop to unhook the
    /// map entry, then back to the owning loop for teardown.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let weak = self.self_weak.clone();
        let conn = Arc::clone(conn);
        self.event_loop.run_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.borrow_mut().remove(conn.name());

        let conn = Arc::clone(conn);
        let io_loop = Arc::clone(conn.event_loop());
        io_loop.queue_in_loop(move || conn.destroy());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if !self.inner.event_loop.is_in_loop_thread() {
            return;
        }
        debug!("TcpServer::drop [{}]", self.inner.name);
        for (_, conn) in self.inner.connections.borrow_mut().drain() {
            let io_loop = Arc::clone(conn.event_loop());
            io_loop.queue_in_loop(move || conn.destroy());
        }
    }
}

/// Logs the up/down transition; the stand-in until the application installs
/// its own connection callback.
fn default_connection_callback(conn: &TcpConnectionPtr) {
    info!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.is_connected() { "UP" } else { "DOWN" }
    );
}

/// Discards incoming bytes; the stand-in until the application installs its
/// own message callback.
fn default_message_callback(_conn: &TcpConnectionPtr, buffer: &mut Buffer, _ts: Timestamp) {
    buffer.retrieve_all();
}
