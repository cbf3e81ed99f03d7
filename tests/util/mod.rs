// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use evio::{EventLoop, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A server running on its own main-loop thread, torn down on drop.
pub struct ServerHarness {
    pub addr: SocketAddr,
    event_loop: Arc<EventLoop>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHarness {
    /// Boots a server with `threads` sub-loops; `configure` installs the
    /// callbacks before `start`.
    pub fn start<F>(threads: usize, configure: F) -> ServerHarness
    where
        F: FnOnce(&TcpServer) + Send + 'static,
    {
        init();

        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let event_loop = EventLoop::new().expect("unable to create main loop");
            let addr = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(&event_loop, addr, "harness")
                .expect("unable to create server");
            server.set_thread_num(threads);
            configure(&server);
            server.start().expect("unable to start server");

            let listen_addr = server.listen_addr().expect("unable to read listen addr");
            tx.send((Arc::clone(&event_loop), listen_addr)).unwrap();

            event_loop.run();
        });

        let (event_loop, addr) = rx.recv().expect("server thread died during startup");
        ServerHarness {
            addr,
            event_loop,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).expect("unable to connect to harness server")
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Reads from `stream` until exactly `len` bytes have arrived.
pub fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    stream
        .read_exact(&mut data)
        .expect("connection ended before the expected byte count");
    data
}

/// Reads from `stream` until EOF.
pub fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    stream
        .read_to_end(&mut data)
        .expect("read_to_end failed");
    data
}

/// Spins until `condition` holds, panicking after `timeout`.
pub fn wait_for<F>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
