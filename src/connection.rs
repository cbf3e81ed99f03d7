use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};

use crate::bound::LoopBound;
use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelHandler};
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

/// Shared handle to a [`TcpConnection`].
pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Invoked on connection establishment and teardown.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked with freshly read bytes and the poll-return time.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
/// Invoked once the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Invoked when the output buffer crosses the high-watermark, with the
/// buffered byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

struct HighWaterMark {
    mark: usize,
    callback: Option<HighWaterMarkCallback>,
}

/// One accepted TCP connection: its socket, buffers and lifecycle.
///
/// A connection is pinned to the sub-loop it was handed to at accept time;
/// every callback it issues runs there. The handle is shared: the server
/// keeps one in its name map, the channel holds a weak tie, and every task
/// posted across threads captures a strong clone, so the connection
/// outlives its own teardown sequence no matter which holder lets go last.
///
/// [`send`](TcpConnection::send) and [`shutdown`](TcpConnection::shutdown)
/// are safe from any thread; everything else happens on the owning loop.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: LoopBound<Rc<RefCell<Channel>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: LoopBound<Buffer>,
    output_buffer: LoopBound<Buffer>,
    connection_callback: ConnectionCallback,
    message_callback: MessageCallback,
    write_complete_callback: Option<WriteCompleteCallback>,
    high_water_mark: LoopBound<HighWaterMark>,
    close_callback: CloseCallback,
    self_weak: Weak<TcpConnection>,
}

impl TcpConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        connection_callback: ConnectionCallback,
        message_callback: MessageCallback,
        write_complete_callback: Option<WriteCompleteCallback>,
        close_callback: CloseCallback,
    ) -> TcpConnectionPtr {
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("SO_KEEPALIVE on fd = {}: {}", socket.fd(), err);
        }
        let owner = event_loop.thread_id();
        let channel = Channel::new(&event_loop, socket.fd());

        let conn = Arc::new_cyclic(|self_weak: &Weak<TcpConnection>| {
            let handler: Weak<dyn ChannelHandler> = self_weak.clone();
            channel.borrow_mut().tie(handler);
            debug!("TcpConnection::new [{}] fd = {}", name, socket.fd());
            TcpConnection {
                event_loop,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                socket,
                channel: LoopBound::new(owner, channel.clone()),
                local_addr,
                peer_addr,
                input_buffer: LoopBound::new(owner, Buffer::new()),
                output_buffer: LoopBound::new(owner, Buffer::new()),
                connection_callback,
                message_callback,
                write_complete_callback,
                high_water_mark: LoopBound::new(
                    owner,
                    HighWaterMark {
                        mark: DEFAULT_HIGH_WATER_MARK,
                        callback: None,
                    },
                ),
                close_callback,
                self_weak: self_weak.clone(),
            }
        });
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The loop this connection is pinned to.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Disables Nagle's algorithm on the underlying socket.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Installs the backpressure callback, fired when the output buffer
    /// first grows past `mark` bytes. Must be called on the owning loop
    /// (typically from the connection callback).
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        let mut hwm = self.high_water_mark.borrow_mut();
        hwm.mark = mark;
        hwm.callback = Some(callback);
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn self_handle(&self) -> Option<TcpConnectionPtr> {
        self.self_weak.upgrade()
    }

    /// Sends `data` to the peer.
    ///
    /// Callable from any thread. Off-loop callers pay one copy: the bytes
    /// are moved into a task posted to the owning loop, so the caller's
    /// slice may be reused immediately. Data sent while the connection is
    /// not `Connected` is dropped.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = match self.self_handle() {
                Some(conn) => conn,
                None => return,
            };
            let owned = data.to_vec();
            self.event_loop
                .queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.name);
            return;
        }

        let channel = Rc::clone(&self.channel.borrow());
        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Try the kernel directly when nothing is queued ahead of us.
        if !channel.borrow().is_writing() && self.output_buffer.borrow().readable() == 0 {
            match syscall!(write(
                self.socket.fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )) {
                Ok(n) => {
                    nwrote = n as usize;
                    remaining = data.len() - nwrote;
                    if remaining == 0 {
                        if let Some(callback) = &self.write_complete_callback {
                            if let Some(conn) = self.self_handle() {
                                let callback = Arc::clone(callback);
                                self.event_loop.queue_in_loop(move || callback(&conn));
                            }
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if let Some(code) = err.raw_os_error() {
                            if code == libc::EPIPE || code == libc::ECONNRESET {
                                fault = true;
                            }
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = self.output_buffer.borrow().readable();
            {
                let hwm = self.high_water_mark.borrow();
                if old_len < hwm.mark && old_len + remaining >= hwm.mark {
                    if let (Some(callback), Some(conn)) = (&hwm.callback, self.self_handle()) {
                        let callback = Arc::clone(callback);
                        let buffered = old_len + remaining;
                        self.event_loop
                            .queue_in_loop(move || callback(&conn, buffered));
                    }
                }
            }
            self.output_buffer.borrow_mut().append(&data[nwrote..]);
            if !channel.borrow().is_writing() {
                channel.borrow_mut().enable_writing();
            }
        }
    }

    /// Half-closes the connection once all queued output has been written.
    ///
    /// Callable from any thread. Reads continue until the peer closes.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = match self.self_handle() {
                Some(conn) => conn,
                None => return,
            };
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // Write interest still armed means unsent bytes remain; the
        // half-close happens in handle_write once the buffer drains.
        if !self.channel.borrow().borrow().is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Completes establishment on the owning loop: arms read interest and
    /// reports the up-transition.
    pub(crate) fn establish(&self) {
        self.event_loop.assert_in_loop_thread();
        debug_assert!(self.state() == State::Connecting);
        self.set_state(State::Connected);
        self.channel.borrow().borrow_mut().enable_reading();

        if let Some(conn) = self.self_handle() {
            (self.connection_callback)(&conn);
        }
    }

    /// Final teardown on the owning loop; always unregisters the channel.
    ///
    /// The kDisconnected check keeps the down-transition report single-shot
    /// when `handle_close` already ran.
    pub(crate) fn destroy(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.borrow().borrow_mut().disable_all();
            if let Some(conn) = self.self_handle() {
                (self.connection_callback)(&conn);
            }
        }
        self.channel.borrow().borrow_mut().remove();
    }
}

impl ChannelHandler for TcpConnection {
    fn handle_read(&self, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let result = self.input_buffer.borrow_mut().read_fd(self.socket.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(conn) = self.self_handle() {
                    let callback = Arc::clone(&self.message_callback);
                    let mut input = self.input_buffer.borrow_mut();
                    callback(&conn, &mut input, receive_time);
                }
            }
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        let channel = Rc::clone(&self.channel.borrow());
        if !channel.borrow().is_writing() {
            warn!("connection fd = {} is down, no more writing", self.socket.fd());
            return;
        }

        let mut output = self.output_buffer.borrow_mut();
        match output.write_fd(self.socket.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable() != 0 {
                    return;
                }
                drop(output);

                channel.borrow_mut().disable_writing();
                if let Some(callback) = &self.write_complete_callback {
                    if let Some(conn) = self.self_handle() {
                        let callback = Arc::clone(callback);
                        self.event_loop.queue_in_loop(move || callback(&conn));
                    }
                }
                if self.state() == State::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
            Err(err) => {
                error!("TcpConnection::handle_write [{}]: {}", self.name, err);
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        debug!(
            "TcpConnection::handle_close [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
        self.set_state(State::Disconnected);
        self.channel.borrow().borrow_mut().disable_all();

        let conn = match self.self_handle() {
            Some(conn) => conn,
            None => return,
        };
        (self.connection_callback)(&conn);
        // The server's close callback unhooks us from its map and posts
        // destroy back here; `conn` keeps the connection alive throughout.
        (self.close_callback)(&conn);
    }

    fn handle_error(&self) {
        let err = self.socket.take_error();
        error!(
            "TcpConnection::handle_error [{}] SO_ERROR = {}",
            self.name, err
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
    }
}
