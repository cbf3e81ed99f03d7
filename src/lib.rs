//! A multi-reactor, non-blocking TCP server library for Linux.
//!
//! evio drives application callbacks from level-triggered epoll event
//! loops, one loop per thread. A main loop accepts connections and hands
//! each one to a worker loop round-robin; from then on everything that
//! touches the connection (reads, buffered writes, lifecycle transitions,
//! user callbacks) happens on that one thread. The only cross-thread
//! primitive is the loop's task queue, backed by an eventfd wakeup.
//!
//! The building blocks:
//!
//! * [`EventLoop`]: the reactor. Poll, dispatch, drain pending tasks.
//! * [`TcpServer`]: listener wiring, worker pool, connection map.
//! * [`TcpConnection`]: per-connection state machine and buffered I/O,
//!   with high-watermark backpressure on the output side.
//! * [`Buffer`]: the read/write byte buffer handed to message callbacks.
//! * [`LoopThread`]/[`LoopPool`]: one-loop-per-thread workers.
//!
//! # Examples
//!
//! An echo server on two worker loops:
//!
//! ```no_run
//! use std::sync::Arc;
//! use evio::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let addr = "0.0.0.0:7000".parse().unwrap();
//!
//!     let server = TcpServer::new(&event_loop, addr, "echo")?;
//!     server.set_thread_num(2);
//!     server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
//!         let message = buffer.retrieve_all_as_string();
//!         conn.send(message.as_bytes());
//!     }));
//!
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Threading model
//!
//! Every channel, buffer and connection is owned by exactly one loop and
//! only ever mutated on that loop's thread. [`TcpConnection::send`] and
//! [`TcpConnection::shutdown`] may be called from anywhere; they forward
//! to the owning loop. Calling any other loop-affine operation from the
//! wrong thread panics.

#![cfg(target_os = "linux")]

#[macro_use]
mod macros;

mod acceptor;
mod bound;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod loop_pool;
mod loop_thread;
mod poller;
mod server;
mod socket;
mod timestamp;

pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback,
};
pub use event_loop::EventLoop;
pub use loop_pool::LoopPool;
pub use loop_thread::{LoopThread, ThreadInitCallback};
pub use server::TcpServer;
pub use timestamp::Timestamp;
