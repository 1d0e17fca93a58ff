#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Error};
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerName, StreamOwned,
};
use tessel_mio::{Handler, Server, ServerOptions};

pub fn given_server<H>(handler: H, tls: Option<Arc<ServerConfig>>) -> Result<Server<H>, Error>
where
    H: Handler,
{
    given_server_with(given_options(tls), handler)
}

pub fn given_options(tls: Option<Arc<ServerConfig>>) -> ServerOptions {
    ServerOptions {
        tls,
        pool_plain: 2,
        pool_confidential: 2,
        ..ServerOptions::default()
    }
}

pub fn given_server_with<H>(options: ServerOptions, handler: H) -> Result<Server<H>, Error>
where
    H: Handler,
{
    Server::bind(options, handler)
}

/// Create a server config with a fresh self-signed certificate, and a client config trusting it.
pub fn given_tls() -> Result<(Arc<ServerConfig>, Arc<ClientConfig>), Error> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = cert.serialize_der()?;
    let key_der = cert.serialize_private_key_der();

    let server = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(cert_der.clone())], PrivateKey(key_der))?;

    let mut roots = RootCertStore::empty();
    roots
        .add(&Certificate(cert_der))
        .map_err(|error| anyhow!("failed to add root: {:?}", error))?;
    let client = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok((Arc::new(server), Arc::new(client)))
}

/// Send a request over plain TCP from another thread, and read until the server closes.
pub fn given_plain_client(addr: SocketAddr, request: &'static [u8]) -> JoinHandle<Result<Vec<u8>, Error>> {
    thread::spawn(move || {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        stream.write_all(request)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        Ok(response)
    })
}

/// Send a request over TLS from another thread, and read until the server closes.
pub fn given_tls_client(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
    request: &'static [u8],
) -> JoinHandle<Result<Vec<u8>, Error>> {
    thread::spawn(move || {
        let name = ServerName::try_from("localhost")
            .map_err(|error| anyhow!("invalid server name: {:?}", error))?;
        let connection = ClientConnection::new(config, name)?;

        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut stream = StreamOwned::new(connection, stream);

        stream.write_all(request)?;
        stream.flush()?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        Ok(response)
    })
}

/// Poll the server until the client thread is done, and return the client's result.
pub fn when_served<H>(
    server: &mut Server<H>,
    client: JoinHandle<Result<Vec<u8>, Error>>,
) -> Result<Vec<u8>, Error>
where
    H: Handler,
{
    let deadline = Instant::now() + Duration::from_secs(10);

    while !client.is_finished() {
        if Instant::now() > deadline {
            bail!("client didn't finish in time");
        }

        server.poll_once(Some(Duration::from_millis(10)))?;
    }

    client
        .join()
        .map_err(|_| anyhow!("client thread panicked"))?
}
