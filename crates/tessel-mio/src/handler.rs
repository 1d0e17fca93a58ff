use anyhow::Error;
use mio::net::TcpStream;
use tessel_http::HttpServerCall;

/// Handler of calls with a parsed request head.
///
/// The handler writes the response through the call. The server closes the connection after the
/// handler returns, an error tears the connection down without a response.
pub trait Handler {
    fn handle(&mut self, call: &mut HttpServerCall<TcpStream>) -> Result<(), Error>;
}

impl<F> Handler for F
where
    F: FnMut(&mut HttpServerCall<TcpStream>) -> Result<(), Error>,
{
    fn handle(&mut self, call: &mut HttpServerCall<TcpStream>) -> Result<(), Error> {
        self(call)
    }
}
