//! DCC wire parsing, the transfer engine, and the process-wide registry.

pub mod ctcp;
pub mod registry;
pub mod transfer;

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::dcc::ctcp::DccAccept;

/// Coordinates `DCC ACCEPT` replies (observed by an `irc::Session`'s CTCP
/// dispatch) back to the `TransferEngine` awaiting them after sending a
/// `DCC RESUME`. Keyed by `(peer_nick, filename, port, token)`, matching the
/// exact `DCC RESUME` we sent, per spec §4.3 step 2 ("await `DCC ACCEPT`
/// matching filename+port+token").
type AcceptKey = (String, String, u16, Option<String>);

#[derive(Default)]
pub struct PendingAccepts {
    waiters: Mutex<HashMap<AcceptKey, oneshot::Sender<DccAccept>>>,
}

impl PendingAccepts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an ACCEPT matching `(peer, filename, port,
    /// token)` — the same triple sent in our `DCC RESUME` — returning the
    /// receiving half. Replaces any prior waiter for the same key.
    pub fn wait_for(
        &self,
        peer: &str,
        filename: &str,
        port: u16,
        token: Option<&str>,
    ) -> oneshot::Receiver<DccAccept> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("pending accepts poisoned").insert(
            (peer.to_string(), filename.to_string(), port, token.map(|s| s.to_string())),
            tx,
        );
        rx
    }

    /// Called by the session's CTCP dispatch when a `DCC ACCEPT` line
    /// arrives. No-op if nothing is waiting for this exact
    /// filename+port+token (the sender cancelled, the peer sent an
    /// unsolicited ACCEPT, or it doesn't match the outstanding RESUME).
    pub fn resolve(&self, peer: &str, accept: DccAccept) {
        let key = (
            peer.to_string(),
            accept.filename.clone(),
            accept.port,
            accept.token.clone(),
        );
        let sender = self.waiters.lock().expect("pending accepts poisoned").remove(&key);
        if let Some(sender) = sender {
            let _ = sender.send(accept);
        }
    }
}
