//! Module with the server engine.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::poll::{Event, EventKind, EventLoop, Token};
use crate::pool::{Handle, Pool};
use crate::queue::Queue;
use crate::request::Request;
use crate::{status, CONTENT_LENGTH_WIDTH, HEAD_TERMINATOR, MAX_HEAD_SIZE};

/// State of a single connection.
#[derive(Debug)]
struct Client {
    sock: TcpStream,
    /// Bytes received and not yet served.
    incoming: Buffer,
    /// Response bytes not yet flushed to the socket.
    outgoing: Buffer,
    /// Number of responses served on this connection.
    num_served: u32,
    /// True iff the connection is in the candidate queue.
    queued: bool,
    /// Close the connection once `outgoing` is fully flushed.
    close_when_flushed: bool,
}

impl Client {
    fn new(sock: TcpStream) -> Client {
        Client {
            sock,
            incoming: Buffer::new(),
            outgoing: Buffer::new(),
            num_served: 0,
            queued: false,
            close_when_flushed: false,
        }
    }
}

/// Responses are built through an immediate-mode API (`status`, `header`,
/// `write`, `send`), so the engine tracks where in that sequence it is to
/// tell valid calls from out-of-order ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ResponseState {
    /// No request is being handled; the starting state, restored by `send`.
    NoTarget,
    /// A request was returned by `wait` but `status` wasn't called yet.
    Status,
    /// `status` was called; `header` and `write` are allowed.
    Headers,
    /// `write` was called; only more `write`s are allowed.
    Content,
}

/// An embeddable HTTP/1.1 server.
///
/// The server multiplexes up to `max_clients` connections over the calling
/// thread; see the [crate docs] for the call protocol and an example. Calls
/// made out of order (`status` after `write`, a second `status`, headers
/// after the body started) are silently ignored rather than reported: the
/// engine cannot unwind an event-driven control path mid-response, so the
/// state machine absorbs the misuse and the misplaced payload is dropped.
///
/// [crate docs]: crate
#[derive(Debug)]
pub struct Server {
    state: ResponseState,
    listener: Option<TcpListener>,
    pool: Pool<Client>,
    max_clients: usize,
    evloop: EventLoop,
    /// Connections whose input holds at least one complete request head.
    /// The body may still be arriving; `wait` checks that when it pops a
    /// candidate. Each connection is queued at most once, guarded by
    /// `Client::queued`.
    queue: Queue<Handle>,
    /// Re-entrance guard for `accept_incoming_connections`.
    accepting: bool,

    // Fields below describe the response under construction and only hold
    // meaning when `state` isn't `NoTarget`.
    /// The connection being responded to.
    target: Option<Handle>,
    /// Offset of the `Content-Length` value placeholder in the target's
    /// output buffer.
    offset_content_length: usize,
    /// Offset of the response body in the target's output buffer.
    offset_content: usize,
    /// `Some` once the application chose through a `Connection` header, or
    /// once the policy was resolved at the first `write`.
    keep_alive: Option<bool>,
    /// Size of the request being served, consumed from the input buffer
    /// after `send`.
    req_bytes: usize,
}

impl Server {
    /// Create a server for at most `max_clients` concurrent connections.
    pub fn new(max_clients: usize) -> io::Result<Server> {
        Ok(Server {
            state: ResponseState::NoTarget,
            listener: None,
            pool: Pool::with_capacity(max_clients),
            max_clients,
            // One extra slot for the listening socket.
            evloop: EventLoop::with_capacity(max_clients + 1)?,
            queue: Queue::with_capacity(max_clients),
            accepting: false,
            target: None,
            offset_content_length: 0,
            offset_content: 0,
            keep_alive: None,
            req_bytes: 0,
        })
    }

    /// Start listening for connections on `addr:port`, on all interfaces
    /// when `addr` is `None`.
    ///
    /// Fails if the server is already listening, or on any socket error.
    /// With `port` 0 the OS assigns a free port, see [`local_addr`].
    ///
    /// [`local_addr`]: Server::local_addr
    pub fn listen(&mut self, port: u16, addr: Option<Ipv4Addr>) -> io::Result<()> {
        if self.listener.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "server is already listening",
            ));
        }

        let addr = addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let address = SocketAddr::V4(SocketAddrV4::new(addr, port));
        let mut listener = new_listener(address, 32)?;
        let local_addr = listener.local_addr()?;
        // Accepting is a read operation as far as readiness is concerned.
        self.evloop
            .add(&mut listener, Interest::READABLE, Token::Listener)?;
        info!("listening on {local_addr}");
        self.listener = Some(listener);
        Ok(())
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "server is not listening",
            )),
        }
    }

    /// Get the next request to handle, blocking until one is available.
    ///
    /// A response still in progress is finalized first, as if [`send`] was
    /// called. All connection I/O happens below this call: it loops
    /// handling socket events until some connection holds a complete
    /// request (head and body), parses the request into `req` and returns.
    /// Connections that send malformed requests are dropped here.
    ///
    /// Errors are fatal to the server as a whole (the readiness poll
    /// failed); per-connection errors only drop the connection.
    ///
    /// [`send`]: Server::send
    pub fn wait(&mut self, req: &mut Request) -> io::Result<()> {
        self.send();
        debug_assert_eq!(self.state, ResponseState::NoTarget);

        loop {
            while self.queue.is_empty() {
                let event = self.evloop.wait()?;
                self.handle_event(event);
            }

            let candidate = match self.queue.pop() {
                Some(candidate) => candidate,
                None => continue,
            };

            // The input buffer is known to contain a complete head, or the
            // connection wouldn't have been queued.
            let (head_len, parse_result) = match self.pool.get_mut(candidate) {
                Some(client) => {
                    client.queued = false;
                    let head = client.incoming.slice_until(HEAD_TERMINATOR, true);
                    (head.len(), req.parse(head))
                }
                // Queued, then torn down before we got here.
                None => continue,
            };

            if let Err(err) = parse_result {
                warn!("parse error: {err}");
                self.remove_client(candidate);
                continue;
            }

            let body_len = match req.content_length() {
                Some(body_len) => body_len,
                None => {
                    warn!("malformed Content-Length header");
                    self.remove_client(candidate);
                    continue;
                }
            };
            let total_len = match head_len.checked_add(body_len) {
                Some(total_len) => total_len,
                None => {
                    warn!("malformed Content-Length header");
                    self.remove_client(candidate);
                    continue;
                }
            };

            if let Some(client) = self.pool.get_mut(candidate) {
                if client.incoming.len() >= total_len {
                    // Request fully received.
                    req.set_body(client.incoming.slice(head_len, total_len));
                    self.target = Some(candidate);
                    self.state = ResponseState::Status;
                    self.req_bytes = total_len;
                    self.keep_alive = None;
                    return Ok(());
                }
            }

            // Still waiting for the request's body; the connection is
            // queued again when more bytes arrive.
        }
    }

    /// Set the status code of the response to the last request returned by
    /// [`wait`]. Must come before any `header` or `write` call; at most
    /// once per response.
    ///
    /// [`wait`]: Server::wait
    pub fn status(&mut self, code: u16) {
        let target = match self.target {
            Some(target) => target,
            None => return,
        };
        if self.state != ResponseState::Status {
            // `status` called twice.
            return;
        }
        if let Some(client) = self.pool.get_mut(target) {
            let mut itoa_buf = itoa::Buffer::new();
            client.outgoing.append(b"HTTP/1.1 ");
            client.outgoing.append(itoa_buf.format(code).as_bytes());
            client.outgoing.append(b" ");
            client.outgoing.append(status::phrase(code).as_bytes());
            client.outgoing.append(b"\r\n");
        }
        self.state = ResponseState::Headers;
    }

    /// Add a response header. May be called multiple times, but only before
    /// the first [`write`]. Without a preceding [`status`] call the status
    /// defaults to 200.
    ///
    /// Two header names are interpreted instead of written:
    /// `"Content-Length"` is reserved to the engine and dropped, and
    /// `"Connection"` only records the keep-alive choice (`"Close"` turns
    /// it off, any other value turns it on); the engine emits its own
    /// `Connection` line.
    ///
    /// [`status`]: Server::status
    /// [`write`]: Server::write
    pub fn header(&mut self, name: &str, value: &str) {
        let target = match self.target {
            Some(target) => target,
            None => return,
        };
        if self.state == ResponseState::Status {
            self.status(200);
        }
        if self.state == ResponseState::Content {
            // Too late, the body started.
            return;
        }
        debug_assert_eq!(self.state, ResponseState::Headers);

        if name == "Content-Length" {
            return;
        }
        if name == "Connection" {
            self.keep_alive = Some(value != "Close");
            return;
        }

        if let Some(client) = self.pool.get_mut(target) {
            client.outgoing.append(name.as_bytes());
            client.outgoing.append(b": ");
            client.outgoing.append(value.as_bytes());
            client.outgoing.append(b"\r\n");
        }
    }

    /// Append bytes to the response body.
    ///
    /// The first call ends the header section: the engine resolves the
    /// keep-alive policy and emits the `Connection` header, the
    /// `Content-Length` placeholder and the empty line. Without a preceding
    /// [`status`] call the status defaults to 200.
    ///
    /// [`status`]: Server::status
    pub fn write(&mut self, data: &[u8]) {
        let target = match self.target {
            Some(target) => target,
            None => return,
        };
        if self.state == ResponseState::Status {
            self.status(200);
        }

        if self.state == ResponseState::Headers {
            // Start of the response body: append the special headers and
            // the empty line separator.
            let num_served = match self.pool.get(target) {
                Some(client) => client.num_served,
                None => return,
            };
            let keep_alive = self.keep_alive.unwrap_or(true)
                && should_keep_alive(self.pool.len(), self.max_clients, num_served);
            self.keep_alive = Some(keep_alive);

            if let Some(client) = self.pool.get_mut(target) {
                let connection: &[u8] = if keep_alive {
                    b"Connection: Keep-Alive\r\n"
                } else {
                    b"Connection: Close\r\n"
                };
                client.outgoing.append(connection);

                // The value is patched in by `send` once the body length is
                // known. The placeholder is exactly 9 spaces.
                client.outgoing.append(b"Content-Length: ");
                self.offset_content_length = client.outgoing.len();
                client.outgoing.append(b"         \r\n");

                client.outgoing.append(b"\r\n");
                self.offset_content = client.outgoing.len();
            }
            self.state = ResponseState::Content;
        }

        if let Some(client) = self.pool.get_mut(target) {
            client.outgoing.append(data);
        }
    }

    /// Finalize the response: patch the `Content-Length` value, arm send
    /// interest so the event loop flushes the bytes, and consume the
    /// request from the input buffer. The response can no longer be
    /// modified.
    ///
    /// The `Content-Length` placeholder is 9 characters wide, so response
    /// bodies over 999,999,999 bytes cannot be served; such a connection is
    /// dropped.
    pub fn send(&mut self) {
        let target = match self.target {
            Some(target) => target,
            None => return,
        };

        // Force out the headers and the body preamble.
        self.write(b"");

        let mut teardown = false;
        match self.pool.get_mut(target) {
            None => {}
            Some(client) if client.outgoing.failed() => {
                // Response construction failed, drop the connection.
                teardown = true;
            }
            Some(client) => {
                let content_length = client.outgoing.len() - self.offset_content;
                let mut itoa_buf = itoa::Buffer::new();
                let formatted = itoa_buf.format(content_length);
                if formatted.len() > CONTENT_LENGTH_WIDTH {
                    warn!("response body too large for the Content-Length value slot");
                    teardown = true;
                } else {
                    client
                        .outgoing
                        .overwrite(self.offset_content_length, formatted.as_bytes());

                    let token = Token::Conn(target);
                    if self
                        .evloop
                        .add_interest(&mut client.sock, token, Interest::WRITABLE)
                        .is_err()
                    {
                        teardown = true;
                    } else {
                        // `write` resolved the policy above, so `keep_alive`
                        // can't be `None` here.
                        let keep_alive = self.keep_alive == Some(true);
                        if !keep_alive {
                            client.close_when_flushed = true;
                            let _ = self.evloop.remove_interest(
                                &mut client.sock,
                                token,
                                Interest::READABLE,
                            );
                        }

                        // The request was served, drop its bytes.
                        client.incoming.consume(self.req_bytes);

                        // On a keep-alive connection pipelining is allowed:
                        // if another complete head is already buffered the
                        // connection becomes a candidate again. It can't be
                        // queued right now, it was just popped and served.
                        if keep_alive && client.incoming.contains(HEAD_TERMINATOR) {
                            if self.queue.push(target) {
                                client.queued = true;
                            }
                        }

                        client.num_served += 1;
                    }
                }
            }
        }
        if teardown {
            self.remove_client(target);
        }

        self.state = ResponseState::NoTarget;
        self.target = None;
        self.keep_alive = None;
        self.req_bytes = 0;
    }

    fn handle_event(&mut self, event: Event) {
        match event.token {
            Token::Listener => self.accept_incoming_connections(),
            Token::Conn(handle) => match event.kind {
                EventKind::Failure => self.remove_client(handle),
                EventKind::Recv => self.handle_client_data(handle),
                EventKind::Send => self.flush_client(handle),
            },
        }
    }

    /// Accept new connections until the pool is full or accepting would
    /// block.
    fn accept_incoming_connections(&mut self) {
        if self.accepting {
            return;
        }
        self.accepting = true;

        while self.pool.has_free_space() {
            let (sock, addr) = match &self.listener {
                Some(listener) => match listener.accept() {
                    Ok(accepted) => accepted,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("error accepting connection: {err}");
                        break;
                    }
                },
                None => break,
            };
            debug!("accepted connection: remote_address={addr}");

            let handle = match self.pool.insert(Client::new(sock)) {
                Some(handle) => handle,
                None => break,
            };
            let token = Token::Conn(handle);

            // Only register for receive events for now, there's nothing to
            // send yet.
            let registered = match self.pool.get_mut(handle) {
                Some(client) => self.evloop.add(&mut client.sock, Interest::READABLE, token),
                None => continue,
            };
            if let Err(err) = registered {
                warn!("couldn't register connection: {err}");
                let _ = self.pool.deallocate(handle);
                continue;
            }

            // The newly accepted socket may already have data buffered by
            // the kernel; pull it in right away.
            self.handle_event(Event {
                kind: EventKind::Recv,
                token,
            });
        }

        self.accepting = false;
    }

    /// A connection is readable: pull in bytes and queue the connection as
    /// a candidate if a complete head arrived.
    fn handle_client_data(&mut self, handle: Handle) {
        let client = match self.pool.get_mut(handle) {
            Some(client) => client,
            None => return,
        };

        let closed = client.incoming.ingest_from(&mut client.sock);
        if closed || client.incoming.failed() {
            debug!("removing connection: peer closed or receive failed");
            self.remove_client(handle);
            return;
        }

        if client.incoming.contains(HEAD_TERMINATOR) {
            if !client.queued {
                if self.queue.push(handle) {
                    client.queued = true;
                }
            }
        } else if client.incoming.len() > MAX_HEAD_SIZE {
            warn!("removing connection: request head too large");
            self.remove_client(handle);
        }
    }

    /// A connection is writable: flush buffered response bytes, and close
    /// the connection if that was the point of keeping it.
    fn flush_client(&mut self, handle: Handle) {
        let client = match self.pool.get_mut(handle) {
            Some(client) => client,
            None => return,
        };

        let _ = client.outgoing.drain_to(&mut client.sock);
        if client.outgoing.failed() {
            debug!("removing connection: send failed");
            self.remove_client(handle);
            return;
        }

        if client.outgoing.is_empty() {
            // Nothing more to send.
            if client.close_when_flushed {
                debug!("closing connection: response flushed");
                self.remove_client(handle);
                return;
            }
            let token = Token::Conn(handle);
            if self
                .evloop
                .remove_interest(&mut client.sock, token, Interest::WRITABLE)
                .is_err()
            {
                self.remove_client(handle);
            }
        }
    }

    /// Tear a connection down: unregister it, drop it from the candidate
    /// queue and free its slot (which closes the socket).
    fn remove_client(&mut self, handle: Handle) {
        let queued = match self.pool.get_mut(handle) {
            Some(client) => {
                let token = Token::Conn(handle);
                if let Err(err) = self.evloop.remove(&mut client.sock, token) {
                    debug!("couldn't deregister connection: {err}");
                }
                client.queued
            }
            None => return,
        };
        if queued {
            let _ = self.queue.remove(&handle);
        }
        let _ = self.pool.deallocate(handle);

        // A freed slot may unblock connections the listener is holding
        // back.
        if self.listener.is_some() {
            self.accept_incoming_connections();
        }
    }
}

/// Create a non-blocking TCP listener bound to `address`.
fn new_listener(address: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = Domain::for_address(address);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    // Allow rebinding the address without waiting out TIME_WAIT.
    socket.set_reuse_address(true)?;

    socket.bind(&address.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Whether a connection may be kept alive, as a function of how loaded the
/// server is and how much this connection was already served.
fn should_keep_alive(num_clients: usize, max_clients: usize, num_served: u32) -> bool {
    // When the server is about 70% full, don't keep connections alive.
    if 10 * num_clients > 7 * max_clients {
        return false;
    }
    // Cap the number of responses served per connection.
    if num_served >= 5 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::should_keep_alive;

    #[test]
    fn keep_alive_downgrades_when_loaded() {
        assert!(should_keep_alive(0, 16, 0));
        assert!(should_keep_alive(11, 16, 0));
        // 70% of 16 is 11.2.
        assert!(!should_keep_alive(12, 16, 0));
        // A single slot is always "too full".
        assert!(!should_keep_alive(1, 1, 0));
    }

    #[test]
    fn keep_alive_downgrades_after_five_responses() {
        assert!(should_keep_alive(1, 16, 4));
        assert!(!should_keep_alive(1, 16, 5));
        assert!(!should_keep_alive(1, 16, 6));
    }
}
