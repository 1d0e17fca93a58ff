use std::{
    io::{ErrorKind, Read, Write},
    sync::Arc,
};

use anyhow::{anyhow, Error};
use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerName,
};

/// Create a server config with a fresh self-signed certificate, and a client trusting it.
pub fn given_tls() -> Result<(Arc<ServerConfig>, ClientConnection), Error> {
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
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from("localhost")
        .map_err(|error| anyhow!("invalid server name: {:?}", error))?;
    let client = ClientConnection::new(Arc::new(client_config), name)?;

    Ok((Arc::new(server), client))
}

/// Encrypt everything the client has pending.
pub fn client_seal(client: &mut ClientConnection) -> Result<Vec<u8>, Error> {
    let mut ciphertext = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut ciphertext)?;
    }

    Ok(ciphertext)
}

/// Feed ciphertext from the server into the client, returning decrypted bytes.
pub fn client_open(client: &mut ClientConnection, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut pending = ciphertext;
    let mut plaintext = Vec::new();

    while !pending.is_empty() {
        client.read_tls(&mut pending)?;
        client.process_new_packets()?;

        // The client only buffers a limited amount of plaintext, take it as we go
        let mut buffer = [0; 4096];
        loop {
            match client.reader().read(&mut buffer) {
                Ok(0) => break,
                Ok(len) => plaintext.extend_from_slice(&buffer[..len]),
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => return Err(error.into()),
            }
        }
    }

    Ok(plaintext)
}

/// Queue plaintext for sending from the client.
pub fn client_send(client: &mut ClientConnection, plaintext: &[u8]) -> Result<(), Error> {
    client.writer().write_all(plaintext)?;
    Ok(())
}
