use std::sync::Arc;

use anyhow::Error;
use mio::net::TcpStream;
use rustls::{Certificate, PrivateKey, ServerConfig};
use tessel_http::{HttpServerCall, ResponseHead};
use tessel_mio::{Server, ServerOptions};
use tracing::{event, Level};

fn main() -> Result<(), Error> {
    devutils::init_logging();

    // Self-signed, browsers will show a warning before connecting
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();

    let tls = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(cert_der)], PrivateKey(key_der))?;

    let options = ServerOptions {
        addr: "127.0.0.1:1443".parse()?,
        tls: Some(Arc::new(tls)),
        pool_plain: 0,
        pool_confidential: 16,
        ..ServerOptions::default()
    };
    let mut server = Server::bind(options, hello)?;

    event!(Level::INFO, addr = ?server.local_addr(), "open https://localhost:1443/ in a browser");
    server.run()?;

    Ok(())
}

fn hello(call: &mut HttpServerCall<TcpStream>) -> Result<(), Error> {
    event!(Level::INFO, path = call.request().target(), "received request");

    let body = format!(
        "<!DOCTYPE html><html><body><h1>Hello over TLS!</h1><p>{} {}</p></body></html>",
        call.request().method(),
        call.request().target()
    );

    let response = ResponseHead::new(200)
        .with_field("Content-Type", "text/html")
        .with_field("Content-Length", body.len().to_string());
    call.write_response_head(&response)?;
    call.write_response_body(&mut body.into_bytes())?;

    Ok(())
}
