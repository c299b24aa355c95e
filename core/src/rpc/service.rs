use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use super::message::{read_frame_bytes, write_frame, RpcMessage, RpcReply, RV_BAD_REQUEST};
use super::query::{QueryTable, Session};
use crate::errors::RpcError;


/// Loopback TCP listener that accepts one connection at a time, reads one
/// framed request, dispatches it through a `QueryTable`, and writes back
/// exactly one framed reply before closing the connection.
pub struct QueryService {
    listener: TcpListener,
    port: u16,
}


impl QueryService {
    /// Bind to an ephemeral loopback port.
    pub fn bind_loopback() -> std::io::Result<QueryService> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        Ok(QueryService { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait up to `timeout` for a connection. `Ok(None)` means the timeout
    /// elapsed with nobody connecting.
    pub fn accept_timeout(&self, timeout: Duration) -> std::io::Result<Option<TcpStream>> {
        self.listener.set_nonblocking(true)?;

        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);

        let result = loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    // Accepted sockets inherit non-blocking mode on some platforms.
                    stream.set_nonblocking(false)?;
                    break Ok(Some(stream));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break Ok(None);
                    }
                    std::thread::sleep(poll_interval);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        let _ = self.listener.set_nonblocking(false);
        result
    }
}


/// Serve one connection: read a request, dispatch, reply.
///
/// A request that cannot be decoded still gets a `rv = 2` reply when the
/// socket allows it.
pub fn serve_connection<S>(
    mut stream: TcpStream,
    table: &mut QueryTable<S>,
    state: &mut S,
    session: &mut Session<'_>,
    timeout: Duration,
) -> Result<String, RpcError> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let payload = read_frame_bytes(&mut stream)?;
    let reply = match serde_json::from_slice::<RpcMessage>(&payload) {
        Ok(msg) => {
            let reply = table.dispatch(state, session, &msg);
            write_frame(&mut stream, &reply)?;
            return Ok(msg.name);
        }
        Err(e) => RpcReply::with_code(RV_BAD_REQUEST, &format!("cannot decode request: {}", e)),
    };
    write_frame(&mut stream, &reply)?;
    Err(RpcError::Frame("undecodable request".into()))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonContext;
    use crate::rpc::message::read_frame;
    use crate::settings::Settings;
    use std::io::Write;
    use std::path::Path;

    fn ctx() -> DaemonContext {
        DaemonContext::new(Path::new("/tmp/lr-service-tests"), "svc", Settings::default())
    }

    /// Connected (client, server) pair over loopback.
    fn paired_streams() -> (TcpStream, TcpStream) {
        let service = QueryService::bind_loopback().unwrap();
        let client = TcpStream::connect(("127.0.0.1", service.port())).unwrap();
        let server = service
            .accept_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("connection should be pending");
        (client, server)
    }

    #[test]
    fn accept_times_out_without_clients() {
        let service = QueryService::bind_loopback().unwrap();
        let started = Instant::now();
        let got = service.accept_timeout(Duration::from_millis(50)).unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn full_dispatch_via_streams() {
        let ctx = ctx();
        let (mut client, server) = paired_streams();
        write_frame(&mut client, &RpcMessage::new("uptime")).unwrap();

        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let name = serve_connection(server, &mut table, &mut (), &mut session, Duration::from_secs(2)).unwrap();
        assert_eq!(name, "uptime");

        let reply: RpcReply = read_frame(&mut client).unwrap();
        assert!(reply.is_ok());
        assert!(reply.get_as::<f64>("uptime").unwrap() >= 0.0);
    }

    #[test]
    fn undecodable_request_gets_bad_request_reply() {
        let ctx = ctx();
        let (mut client, server) = paired_streams();
        let bogus = br#"{"kwargs": 5}"#;
        client.write_all(&(bogus.len() as u32).to_be_bytes()).unwrap();
        client.write_all(bogus).unwrap();

        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let result = serve_connection(server, &mut table, &mut (), &mut session, Duration::from_secs(2));
        assert!(result.is_err());

        let reply: RpcReply = read_frame(&mut client).unwrap();
        assert_eq!(reply.rv, RV_BAD_REQUEST);
    }

    #[test]
    fn silent_client_times_out_on_server() {
        let ctx = ctx();
        let (_client, server) = paired_streams();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let result = serve_connection(server, &mut table, &mut (), &mut session, Duration::from_millis(50));
        assert!(matches!(result, Err(RpcError::Io(_))));
    }
}
