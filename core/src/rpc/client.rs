//! Client side of the query protocol.
//!
//! A `QueryInterface` addresses one daemon instance, either locally through
//! its port record or remotely through an externally supplied `host:port`.
//! It only moves `name/args/kwargs` across the wire; callers interpret
//! replies.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use super::message::{read_frame, write_frame, RpcMessage, RpcReply};
use crate::daemon::InstanceDir;
use crate::errors::RpcError;
use crate::settings::Settings;


#[derive(Debug, Clone)]
enum Target {
    Local(InstanceDir),
    Remote { host: String, port: u16 },
}


#[derive(Debug, Clone)]
pub struct QueryInterface {
    target: Target,
    timeout: Duration,
    trials: u32,
    backoff: Duration,
}


impl QueryInterface {
    /// Talk to an instance on this machine, finding its port from the
    /// port record on every attempt.
    pub fn local(instance: InstanceDir, settings: &Settings) -> QueryInterface {
        QueryInterface::with_target(Target::Local(instance), settings)
    }

    /// Talk to an instance at a known address.
    pub fn remote(host: &str, port: u16, settings: &Settings) -> QueryInterface {
        QueryInterface::with_target(
            Target::Remote {
                host: host.to_string(),
                port,
            },
            settings,
        )
    }

    fn with_target(target: Target, settings: &Settings) -> QueryInterface {
        QueryInterface {
            target,
            timeout: settings.protocol_timeout(),
            trials: settings.query_trials.max(1),
            backoff: settings.refused_backoff(),
        }
    }

    pub fn with_trials(mut self, trials: u32) -> QueryInterface {
        self.trials = trials.max(1);
        self
    }

    /// Human-readable name of the target, for logs and errors.
    pub fn describe(&self) -> String {
        match &self.target {
            Target::Local(instance) => instance.name().to_string(),
            Target::Remote { host, port } => format!("{}:{}", host, port),
        }
    }

    /// One request, one reply. Refused connections and missing port
    /// records are retried up to `trials` times; anything else (notably
    /// "no reply") is returned at once.
    pub fn call(&self, msg: &RpcMessage) -> Result<RpcReply, RpcError> {
        let mut attempt = 1;
        loop {
            match self.round_trip(msg) {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.trials => {
                    debug!(target_instance = %self.describe(), query = %msg.name, attempt, error = %e, "retrying");
                    attempt += 1;
                    std::thread::sleep(self.backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Like `call`, but a nonzero `rv` becomes `RpcError::Remote`.
    pub fn call_ok(&self, msg: &RpcMessage) -> Result<RpcReply, RpcError> {
        let reply = self.call(msg)?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(RpcError::Remote {
                query: msg.name.clone(),
                rv: reply.rv,
                msgbody: reply.msgbody,
            })
        }
    }

    /// Query by name with no arguments.
    pub fn query(&self, name: &str) -> Result<RpcReply, RpcError> {
        self.call(&RpcMessage::new(name))
    }

    /// A successful `uptime` query with a non-negative uptime.
    pub fn daemon_is_alive(&self) -> bool {
        match self.query("uptime") {
            Ok(reply) => reply.is_ok() && reply.get_as::<f64>("uptime").map_or(false, |u| u >= 0.0),
            Err(_) => false,
        }
    }

    /// Send `stop`, wait half the protocol timeout, then check that the
    /// port record is gone. Returns false when the record outlived the
    /// wait and had to be removed by force. Remote targets cannot be
    /// verified and report true once the stop was acknowledged.
    pub fn stop(&self) -> Result<bool, RpcError> {
        self.call_ok(&RpcMessage::new("stop"))?;
        let instance = match &self.target {
            Target::Local(instance) => instance,
            Target::Remote { .. } => return Ok(true),
        };

        std::thread::sleep(self.timeout / 2);
        if !instance.has_port_record() {
            return Ok(true);
        }
        warn!(instance = instance.name(), "port record still present after stop, forcing cleanup");
        instance.cleanup();
        Ok(false)
    }

    fn resolve(&self) -> Result<SocketAddr, RpcError> {
        match &self.target {
            Target::Local(instance) => match instance.read_port() {
                Some(port) => Ok(SocketAddr::from(([127, 0, 0, 1], port))),
                None => Err(RpcError::NotRunning {
                    name: instance.name().to_string(),
                }),
            },
            Target::Remote { host, port } => (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| RpcError::Frame(format!("cannot resolve {}:{}", host, port))),
        }
    }

    fn round_trip(&self, msg: &RpcMessage) -> Result<RpcReply, RpcError> {
        let addr = self.resolve()?;
        let mut stream = match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(stream) => stream,
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(RpcError::ConnectionRefused {
                    addr: addr.to_string(),
                })
            }
            Err(e) => return Err(RpcError::Io(e)),
        };
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        write_frame(&mut stream, msg)?;
        read_frame(&mut stream).map_err(|e| match e {
            RpcError::Io(io) if is_silence(&io) => RpcError::NoReply {
                addr: addr.to_string(),
                query: msg.name.clone(),
            },
            other => other,
        })
    }
}


/// Timeouts and a connection closed before any reply byte both mean the
/// server never answered.
fn is_silence(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::UnexpectedEof
    )
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
