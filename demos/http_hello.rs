use anyhow::Error;
use mio::net::TcpStream;
use tessel_http::{HttpServerCall, ResponseHead};
use tessel_mio::{Server, ServerOptions};
use tracing::{event, Level};

fn main() -> Result<(), Error> {
    devutils::init_logging();

    let options = ServerOptions {
        addr: "127.0.0.1:1234".parse()?,
        ..ServerOptions::default()
    };
    let mut server = Server::bind(options, hello)?;

    event!(Level::INFO, addr = ?server.local_addr(), "open http://localhost:1234/ in a browser");
    server.run()?;

    Ok(())
}

fn hello(call: &mut HttpServerCall<TcpStream>) -> Result<(), Error> {
    let request = call.request();
    event!(
        Level::INFO,
        method = request.method(),
        path = request.target(),
        "received request"
    );

    let response = ResponseHead::new(200)
        .with_field("Content-Type", "text/html")
        .with_field("Content-Length", RESPONSE.len().to_string());
    call.write_response_head(&response)?;
    call.write_response_body(&mut RESPONSE)?;

    Ok(())
}

const RESPONSE: &str = "<!DOCTYPE html><html><body><h1>Hello, World!</h1></body></html>";
