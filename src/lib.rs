//! A small, embeddable HTTP/1.1 server core.
//!
//! This crate serves HTTP directly from the calling thread without an async
//! runtime or a framework on top. A [`Server`] owns a single listening
//! endpoint and a fixed-capacity pool of connections, multiplexed by a
//! readiness-based event loop. The application drives it with five calls:
//!
//! * [`Server::listen`] binds the listening socket,
//! * [`Server::wait`] blocks until a complete request is available,
//! * [`Server::status`], [`Server::header`] and [`Server::write`] build the
//!   response, and
//! * [`Server::send`] finalizes it and hands the bytes to the event loop.
//!
//! All socket I/O is non-blocking; the only blocking point is `wait` when no
//! request is pending. There are no worker threads, no locks and no shared
//! state between connections.
//!
//! # Limitations
//!
//! Only `GET` and `POST` requests are accepted, a request body must be
//! declared through `Content-Length` (no chunked transfer encoding, no
//! trailers) and must fit in memory before `wait` returns it. Responses
//! larger than 999,999,999 bytes cannot be served, see [`Server::send`].
//!
//! # Examples
//!
//! ```no_run
//! use httplet::{Request, Server};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut server = Server::new(1024)?;
//! server.listen(8080, None)?;
//!
//! let mut req = Request::new();
//! loop {
//!     server.wait(&mut req)?;
//!     server.status(200);
//!     server.header("Content-Type", "text/plain");
//!     server.write(b"Hello, world!");
//!     server.send();
//! }
//! # }
//! ```

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    variant_size_differences
)]

pub mod buffer;
pub mod method;
pub mod poll;
pub mod pool;
pub mod queue;
pub mod request;
pub mod server;
mod span;
pub mod status;
pub mod uri;

#[doc(no_inline)]
pub use buffer::Buffer;
#[doc(no_inline)]
pub use method::Method;
#[doc(no_inline)]
pub use poll::{Event, EventKind, EventLoop, Token};
#[doc(no_inline)]
pub use pool::{Handle, Pool};
#[doc(no_inline)]
pub use queue::Queue;
#[doc(no_inline)]
pub use request::{ParseError, Request};
#[doc(no_inline)]
pub use server::Server;
pub use span::Span;
#[doc(no_inline)]
pub use uri::{Authority, Host, Ipv4, Ipv6, Url};

/// Maximum number of headers captured from a single [`Request`].
///
/// Headers beyond this limit are dropped and counted in
/// [`Request::ignored_count`].
pub const MAX_REQUEST_HEADERS: usize = 32;

/// Maximum size of a request head (the request line and the headers).
///
/// A connection that accumulates more input than this without completing a
/// head is dropped. RFC 7230 section 3.1.1 recommends "all HTTP senders and
/// recipients support, at a minimum, request-line lengths of 8000 octets."
pub const MAX_HEAD_SIZE: usize = 16384;

/// Minimum amount of free buffer space ensured before every read from a
/// connection, to avoid many small reads.
pub(crate) const MIN_READ_SIZE: usize = 256;

/// Width of the placeholder the `Content-Length` value is patched into.
pub(crate) const CONTENT_LENGTH_WIDTH: usize = 9;

/// Token terminating a request head.
pub(crate) const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
