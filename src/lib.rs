#![deny(rust_2018_idioms, unused_imports)]
#![doc(test(attr(deny(warnings))))]

//! A reactor-based chat server core speaking HTTP/1.1, WebSocket, RTSP, SIP
//! and FTP control framing over a single `mio` event loop per worker.
//!
//! The pieces compose bottom-up: [`buffer`] and [`poller`] are the raw I/O
//! primitives; [`event_loop`] and [`channel`] build a single-threaded
//! reactor on top; [`acceptor`] and [`loop_pool`] turn that into a pool of
//! I/O threads that own connections; [`connection`] and [`router`] frame
//! bytes into protocol messages via [`codec`]; [`http_server`] wires
//! [`session`], [`store`], [`rate_limit`] and [`metrics`] into the
//! application behavior dispatched from those messages.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod ftp_service;
pub mod http_server;
pub mod loop_pool;
pub mod metrics;
pub mod poller;
pub mod rate_limit;
pub mod router;
pub mod session;
pub mod sip_service;
pub mod store;
pub mod tcp_server;
pub mod timer;
pub mod worker_pool;
