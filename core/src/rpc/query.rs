//! Query registration and dispatch.
//!
//! A `QueryTable<S>` maps query names to handlers over the daemon's state
//! `S`. Every table carries the built-in `uptime`, `status` and `stop`
//! queries; roles add their own with `register`.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use super::message::{RpcMessage, RpcReply, PROTOCOL_VERSION, RV_BAD_REQUEST, RV_FAILED};
use crate::daemon::DaemonContext;


/// Per-request view of the daemon handed to every handler.
pub struct Session<'a> {
    pub ctx: &'a DaemonContext,
    pub started: Instant,
    quit: bool,
}


impl<'a> Session<'a> {
    pub fn new(ctx: &'a DaemonContext, started: Instant) -> Session<'a> {
        Session {
            ctx,
            started,
            quit: false,
        }
    }

    /// Seconds since the run loop started.
    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Ask the run loop to exit after this reply is sent.
    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }
}


/// A handler fills in the reply. An `Err` marks the call failed: the reply
/// gets `rv = 1` and the message, and the failure counter is bumped.
pub type Handler<S> =
    Box<dyn FnMut(&mut S, &mut Session<'_>, &RpcMessage, &mut RpcReply) -> Result<(), String> + Send>;


/// Invocation statistics for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub calls: u64,
    pub failures: u64,
    pub last_called_ms: Option<u64>,
}


struct Query<S> {
    handler: Handler<S>,
    stats: QueryStats,
}


pub struct QueryTable<S> {
    queries: BTreeMap<String, Query<S>>,
}


impl<S> Default for QueryTable<S> {
    fn default() -> Self {
        Self::new()
    }
}


impl<S> QueryTable<S> {
    /// A table holding only the built-in queries.
    pub fn new() -> QueryTable<S> {
        let mut table = QueryTable {
            queries: BTreeMap::new(),
        };
        table.register("uptime", |_state, session, _msg, reply| {
            reply.rv = 0;
            reply.set("uptime", session.uptime());
            Ok(())
        });
        table.register("status", |_state, session, _msg, reply| {
            reply.succeed(format!(
                "{} alive (pid {}, up {:.1}s)",
                session.ctx.name(),
                std::process::id(),
                session.uptime()
            ));
            Ok(())
        });
        table.register("stop", |_state, session, _msg, reply| {
            session.request_quit();
            reply.succeed(format!("{} stopping", session.ctx.name()));
            Ok(())
        });
        table.register("queries", |_state, _session, _msg, reply| {
            // Replaced with real data in `dispatch`, which owns the stats.
            reply.rv = 0;
            Ok(())
        });
        table
    }

    /// Bind `name` to a handler, replacing any previous binding.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: FnMut(&mut S, &mut Session<'_>, &RpcMessage, &mut RpcReply) -> Result<(), String>
            + Send
            + 'static,
    {
        self.queries.insert(
            name.to_string(),
            Query {
                handler: Box::new(handler),
                stats: QueryStats::default(),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.queries.keys().map(String::as_str).collect()
    }

    pub fn stats(&self, name: &str) -> Option<&QueryStats> {
        self.queries.get(name).map(|q| &q.stats)
    }

    /// Run the named query and build its reply. Never panics on unknown
    /// names or failing handlers.
    pub fn dispatch(&mut self, state: &mut S, session: &mut Session<'_>, msg: &RpcMessage) -> RpcReply {
        let mut reply = RpcReply::unset();

        if msg.v != PROTOCOL_VERSION {
            reply.rv = RV_BAD_REQUEST;
            reply.msgbody = Some(format!(
                "unsupported protocol version {} (server speaks {})",
                msg.v, PROTOCOL_VERSION
            ));
            return reply;
        }

        let now = now_ms();
        let query = match self.queries.get_mut(&msg.name) {
            Some(q) => q,
            None => {
                reply.msgbody = Some(format!(
                    "no query named '{}' on {}",
                    msg.name,
                    session.ctx.name()
                ));
                return reply;
            }
        };

        query.stats.calls += 1;
        query.stats.last_called_ms = Some(now);
        if let Err(message) = (query.handler)(state, session, msg, &mut reply) {
            query.stats.failures += 1;
            reply.rv = RV_FAILED;
            reply.msgbody = Some(message);
        }

        if msg.name == "queries" {
            let stats: BTreeMap<&str, &QueryStats> = self
                .queries
                .iter()
                .map(|(name, q)| (name.as_str(), &q.stats))
                .collect();
            reply.set("queries", serde_json::to_value(stats).unwrap_or_default());
        }

        reply
    }
}


pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::RV_UNSET;
    use crate::settings::Settings;
    use std::path::Path;

    fn ctx() -> DaemonContext {
        DaemonContext::new(Path::new("/tmp/lr-query-tests"), "unit", Settings::default())
    }

    #[test]
    fn builtins_are_registered() {
        let table: QueryTable<()> = QueryTable::new();
        for name in ["uptime", "status", "stop", "queries"] {
            assert!(table.contains(name), "missing builtin {}", name);
        }
    }

    #[test]
    fn uptime_is_non_negative() {
        let ctx = ctx();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let reply = table.dispatch(&mut (), &mut session, &RpcMessage::new("uptime"));
        assert!(reply.is_ok());
        assert!(reply.get_as::<f64>("uptime").unwrap() >= 0.0);
    }

    #[test]
    fn stop_sets_quit_flag() {
        let ctx = ctx();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let reply = table.dispatch(&mut (), &mut session, &RpcMessage::new("stop"));
        assert!(reply.is_ok());
        assert!(session.quit_requested());
    }

    #[test]
    fn unknown_query_keeps_default_rv() {
        let ctx = ctx();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let reply = table.dispatch(&mut (), &mut session, &RpcMessage::new("frobnicate"));
        assert_eq!(reply.rv, RV_UNSET);
        assert!(reply.msgbody.unwrap().contains("frobnicate"));
    }

    #[test]
    fn version_mismatch_is_bad_request() {
        let ctx = ctx();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        let mut msg = RpcMessage::new("uptime");
        msg.v = 99;
        let reply = table.dispatch(&mut (), &mut session, &msg);
        assert_eq!(reply.rv, RV_BAD_REQUEST);
        assert_eq!(table.stats("uptime").unwrap().calls, 0);
    }

    #[test]
    fn handler_state_and_counters() {
        let ctx = ctx();
        let mut table: QueryTable<Vec<String>> = QueryTable::new();
        table.register("push", |state: &mut Vec<String>, _s, msg, reply| {
            let item = msg.kwarg_str("item").ok_or("missing 'item'")?;
            state.push(item.to_string());
            reply.succeed("pushed");
            Ok(())
        });

        let mut state = Vec::new();
        let mut session = Session::new(&ctx, Instant::now());

        let ok = table.dispatch(&mut state, &mut session, &RpcMessage::new("push").kwarg("item", "a"));
        assert!(ok.is_ok());
        let bad = table.dispatch(&mut state, &mut session, &RpcMessage::new("push"));
        assert_eq!(bad.rv, RV_FAILED);
        assert_eq!(bad.msgbody.as_deref(), Some("missing 'item'"));

        assert_eq!(state, vec!["a".to_string()]);
        let stats = table.stats("push").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_called_ms.is_some());
    }

    #[test]
    fn queries_reports_stats() {
        let ctx = ctx();
        let mut table: QueryTable<()> = QueryTable::new();
        let mut session = Session::new(&ctx, Instant::now());
        table.dispatch(&mut (), &mut session, &RpcMessage::new("uptime"));
        let reply = table.dispatch(&mut (), &mut session, &RpcMessage::new("queries"));
        let stats = reply.get("queries").unwrap();
        assert_eq!(stats["uptime"]["calls"], 1);
        assert_eq!(stats["queries"]["calls"], 1);
    }
}
