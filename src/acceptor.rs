use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::error;

use crate::bound::LoopBound;
use crate::channel::{Channel, ChannelHandler};
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::timestamp::Timestamp;

pub(crate) type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr)>;

/// Hooks a listening socket into the main loop and hands accepted sockets
/// to the server.
///
/// The listener is bound at construction (`SO_REUSEADDR` + `SO_REUSEPORT`,
/// non-blocking); `listen` arms read interest. Each readable event drains
/// the accept queue until `EWOULDBLOCK`.
pub(crate) struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: LoopBound<Rc<RefCell<Channel>>>,
    new_connection_callback: LoopBound<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: &SocketAddr,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_stream(listen_addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(true)?;
        socket.bind(listen_addr)?;

        let owner = event_loop.thread_id();
        let channel = Channel::new(&event_loop, socket.fd());
        let acceptor = Arc::new(Acceptor {
            event_loop,
            socket,
            channel: LoopBound::new(owner, channel.clone()),
            new_connection_callback: LoopBound::new(owner, None),
            listening: AtomicBool::new(false),
        });
        let acceptor_dyn: Arc<dyn ChannelHandler> = acceptor.clone();
        let handler: Weak<dyn ChannelHandler> = Arc::downgrade(&acceptor_dyn);
        channel.borrow_mut().tie(handler);
        Ok(acceptor)
    }

    /// The bound address, with the kernel-chosen port resolved.
    pub(crate) fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.borrow_mut() = Some(callback);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        self.socket.listen()?;
        self.channel.borrow().borrow_mut().enable_reading();
        Ok(())
    }
}

impl ChannelHandler for Acceptor {
    fn handle_read(&self, _receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => {
                    let callback = self.new_connection_callback.borrow();
                    if let Some(callback) = callback.as_ref() {
                        callback(socket, peer_addr);
                    }
                    // An unset callback drops the socket, refusing the
                    // connection.
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    error!("Acceptor::handle_read: {}", err);
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        error!("file descriptor limit reached, pausing accept");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.event_loop.is_in_loop_thread() {
            let channel = Rc::clone(&self.channel.borrow());
            channel.borrow_mut().disable_all();
            channel.borrow_mut().remove();
        }
    }
}
