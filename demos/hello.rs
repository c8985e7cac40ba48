//! The smallest possible application: answer every request with
//! "Hello, world!".
//!
//! Run with `cargo run --example hello` and point a browser (or curl) at
//! <http://127.0.0.1:8080>.

use httplet::{Request, Server};

fn main() -> std::io::Result<()> {
    // Enable logging.
    std_logger::Config::logfmt().init();

    let mut server = Server::new(16384)?;
    server.listen(8080, None)?;

    let mut req = Request::new();
    loop {
        server.wait(&mut req)?;
        server.status(200);
        server.header("Content-Type", "text/plain");
        server.write(b"Hello, world!");
        server.send();
    }
}
