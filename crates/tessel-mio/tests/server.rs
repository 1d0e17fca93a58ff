mod utils;

use std::{cell::Cell, rc::Rc, sync::Arc};

use anyhow::{anyhow, Error};
use mio::net::TcpStream;
use tessel_http::{HttpServerCall, ResponseHead};
use tracing_test::traced_test;

use crate::utils::{
    given_options, given_plain_client, given_server, given_server_with, given_tls,
    given_tls_client, when_served,
};

const HELLO_REQUEST: &[u8] = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";
const HELLO_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

fn hello(call: &mut HttpServerCall<TcpStream>) -> Result<(), Error> {
    let response = ResponseHead::new(200).with_field("Content-Length", "5");
    call.write_response_head(&response)?;
    call.write_response_body(&mut "hello")?;
    Ok(())
}

#[test]
#[traced_test]
fn plain_request_gets_response() -> Result<(), Error> {
    let mut server = given_server(hello, None)?;

    let client = given_plain_client(server.local_addr(), HELLO_REQUEST);
    let response = when_served(&mut server, client)?;

    assert_eq!(response, HELLO_RESPONSE);
    assert_eq!(server.connections(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn tls_request_gets_response() -> Result<(), Error> {
    let (server_config, client_config) = given_tls()?;
    let mut server = given_server(hello, Some(server_config))?;

    let client = given_tls_client(server.local_addr(), client_config, HELLO_REQUEST);
    let response = when_served(&mut server, client)?;

    assert_eq!(response, HELLO_RESPONSE);
    assert_eq!(server.connections(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn sequential_connections_are_served() -> Result<(), Error> {
    let mut server = given_server(hello, None)?;

    for _ in 0..4 {
        let client = given_plain_client(server.local_addr(), HELLO_REQUEST);
        let response = when_served(&mut server, client)?;
        assert_eq!(response, HELLO_RESPONSE);
    }

    Ok(())
}

#[test]
#[traced_test]
fn malformed_request_gets_bad_request() -> Result<(), Error> {
    let handled = Rc::new(Cell::new(0));
    let counter = handled.clone();
    let handler = move |call: &mut HttpServerCall<TcpStream>| -> Result<(), Error> {
        counter.set(counter.get() + 1);
        hello(call)
    };
    let mut server = given_server(handler, None)?;

    let client = given_plain_client(server.local_addr(), b"NOT A REQUEST AT ALL\r\n\r\n");
    let response = when_served(&mut server, client)?;

    assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(handled.get(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn oversized_head_gets_rejected() -> Result<(), Error> {
    let mut server = given_server(hello, None)?;

    // Twice the default head limit
    let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
    request.resize(16 * 1024, b'a');
    request.extend_from_slice(b"\r\n\r\n");
    let request: &'static [u8] = Box::leak(request.into_boxed_slice());

    let client = given_plain_client(server.local_addr(), request);
    let response = when_served(&mut server, client);

    // The server may close before the client is done sending, which resets the connection
    if let Ok(response) = response {
        assert!(response.starts_with(b"HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    }
    assert_eq!(server.connections(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn large_response_is_drained() -> Result<(), Error> {
    let body: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    let expected = body.clone();

    let handler = move |call: &mut HttpServerCall<TcpStream>| -> Result<(), Error> {
        let response =
            ResponseHead::new(200).with_field("Content-Length", body.len().to_string());
        call.write_response_head(&response)?;
        call.write_response_body(&mut body.clone())?;
        Ok(())
    };
    // The handler runs on the event loop, the whole response has to fit while the client reads
    let mut options = given_options(None);
    options.call.max_backlog = 8 * 1024 * 1024;
    let mut server = given_server_with(options, handler)?;

    let client = given_plain_client(server.local_addr(), HELLO_REQUEST);
    let response = when_served(&mut server, client)?;

    let head_len = response.len() - expected.len();
    assert!(response[..head_len].starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(response[head_len..] == expected[..]);

    Ok(())
}

#[test]
#[traced_test]
fn handler_error_closes_without_response() -> Result<(), Error> {
    let handler = |_call: &mut HttpServerCall<TcpStream>| -> Result<(), Error> {
        Err(anyhow!("handler refused"))
    };
    let mut server = given_server(handler, None)?;

    let client = given_plain_client(server.local_addr(), HELLO_REQUEST);
    let response = when_served(&mut server, client)?;

    assert!(response.is_empty());
    assert!(logs_contain("connection failed"));
    assert_eq!(server.connections(), 0);

    Ok(())
}

#[test]
#[traced_test]
fn failed_session_start_deregisters_stream() -> Result<(), Error> {
    let (server_config, _) = given_tls()?;

    // Fragment sizes this small are refused when a session starts
    let mut server_config = (*server_config).clone();
    server_config.max_fragment_size = Some(1);
    let mut server = given_server(hello, Some(Arc::new(server_config)))?;

    let client = given_plain_client(server.local_addr(), HELLO_REQUEST);
    if let Ok(response) = when_served(&mut server, client) {
        assert!(response.is_empty());
    }

    assert!(logs_contain("failed to start tls session"));
    assert!(logs_contain("stream deregistered"));
    assert!(!logs_contain("failed to deregister stream"));
    assert_eq!(server.connections(), 0);

    Ok(())
}
