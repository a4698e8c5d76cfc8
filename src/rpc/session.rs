//! Client and server halves of a session.
//!
//! A session is two round trips under one random id: nonce request and nonce
//! response, then an authenticated RPC request and RPC response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;
use tracing::{debug, trace};

use crate::common::{
    random_nonce, Contact, Id, Message, Nonce, NonceMessage, RequestPayload, ResponsePayload,
    RpcBody, RpcMessage,
};
use crate::TaskError;

use super::server;
use super::socket::{Dispatcher, Inbound};
use super::Rpc;

/// Deregisters a session when it ends, however it ends.
struct Registration<'a> {
    dispatcher: &'a Dispatcher,
    session_id: i64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.session_id);
    }
}

/// Runs the client half of a session with `to`.
///
/// A verified reply adds its sender to the routing table before it is returned.
/// A missing reply or a failed send counts as a failure of `to`.
pub(crate) fn call(
    rpc: &Arc<Rpc>,
    to: &Contact,
    request: RequestPayload,
) -> Result<ResponsePayload, TaskError> {
    if rpc.is_shutdown() {
        return Err(TaskError::Shutdown);
    }

    let (session_id, inbox) = rpc.dispatcher.register();
    let _registration = Registration {
        dispatcher: &rpc.dispatcher,
        session_id,
    };
    let timeout = rpc.config.request_timeout;

    let nonce = random_nonce();
    send(
        rpc,
        to.address(),
        Message::Nonce(NonceMessage {
            is_response: false,
            session_id,
            sender: rpc.id,
            nonce,
        }),
    )
    .map_err(|error| send_failed(rpc, to, error))?;

    let Some(peer_nonce) = receive(&inbox, timeout, |inbound| match inbound.message {
        Message::Nonce(message)
            if message.is_response && compare_socket_addr(&to.address(), &inbound.from) =>
        {
            Some(message)
        }
        _ => None,
    }) else {
        return Err(timed_out(rpc, to, "nonce response"));
    };

    rpc_message(rpc, session_id, *to.id(), &peer_nonce, nonce, RpcBody::Request(request))
        .and_then(|message| send(rpc, to.address(), message))
        .map_err(|error| send_failed(rpc, to, error))?;

    let reply = receive(&inbox, timeout, |inbound| match inbound.message {
        Message::Rpc(message) if compare_socket_addr(&to.address(), &inbound.from) => {
            accept(rpc, &message, &nonce, &peer_nonce).then_some((message, inbound.from))
        }
        _ => None,
    });

    let Some((message, from)) = reply else {
        return Err(timed_out(rpc, to, "rpc response"));
    };

    match message.rpc {
        RpcBody::Response(response) => {
            rpc.record_success(Contact::new(message.identity.node_id, from));
            Ok(response)
        }
        RpcBody::Request(_) => Err(TaskError::UnexpectedResponse),
    }
}

/// Runs the server half of a session opened by `request`.
pub(crate) fn serve(
    rpc: &Arc<Rpc>,
    request: NonceMessage,
    from: SocketAddr,
    inbox: Receiver<Inbound>,
) {
    let session_id = request.session_id;
    let _registration = Registration {
        dispatcher: &rpc.dispatcher,
        session_id,
    };

    let nonce = random_nonce();
    let nonce_response = Message::Nonce(NonceMessage {
        is_response: true,
        session_id,
        sender: rpc.id,
        nonce,
    });
    if send(rpc, from, nonce_response).is_err() {
        return;
    }

    let received = receive(&inbox, rpc.config.request_timeout, |inbound| {
        match inbound.message {
            Message::Rpc(message) if inbound.from == from => {
                accept(rpc, &message, &nonce, &request).then_some(message)
            }
            _ => None,
        }
    });

    let Some(message) = received else {
        trace!(context = "session", session_id, ?from, "Client abandoned session");
        return;
    };

    let RpcBody::Request(payload) = message.rpc else {
        debug!(session_id, ?from, "Expected a request, got a response");
        return;
    };

    let response = server::handle_request(rpc, &message.identity, payload);
    let requester = message.identity.node_id;

    let reply = rpc_message(
        rpc,
        session_id,
        requester,
        &request,
        nonce,
        RpcBody::Response(response),
    );

    match reply {
        Ok(reply) => {
            if send(rpc, from, reply).is_ok() {
                rpc.record_success(Contact::new(requester, from));
            }
        }
        Err(error) => debug!(?error, session_id, "Failed to build response"),
    }
}

/// Drops messages of blacklisted users and messages failing authentication.
fn accept(rpc: &Rpc, message: &RpcMessage, sent_nonce: &Nonce, received: &NonceMessage) -> bool {
    if rpc.is_blacklisted(&message.identity.user_id) {
        trace!(
            context = "session",
            user_id = %message.identity.user_id,
            "Dropped message of blacklisted user"
        );
        return false;
    }

    match rpc.security().check(message, sent_nonce, received) {
        Ok(()) => true,
        Err(error) => {
            debug!(
                ?error,
                session_id = message.session_id,
                sender = ?received.sender,
                "Dropped unauthenticated message"
            );
            false
        }
    }
}

/// Signs `body` for `addressee`, whose nonce message is `peer_nonce`.
fn rpc_message(
    rpc: &Rpc,
    session_id: i64,
    addressee: Id,
    peer_nonce: &NonceMessage,
    own_nonce: Nonce,
    body: RpcBody,
) -> Result<Message, TaskError> {
    let encoded_rpc = body
        .encode()
        .map_err(|error| TaskError::Send(error.to_string()))?;
    let authenticator =
        rpc.security()
            .build_authenticator(addressee, peer_nonce.nonce, own_nonce, &encoded_rpc);

    Ok(Message::Rpc(RpcMessage {
        session_id,
        identity: rpc.security().identity().clone(),
        authenticator,
        rpc: body,
        encoded_rpc,
    }))
}

fn send(rpc: &Rpc, to: SocketAddr, message: Message) -> Result<(), TaskError> {
    rpc.socket.send(to, &message).map_err(|error| {
        debug!(?error, ?to, "Error sending session message");
        TaskError::Send(error.to_string())
    })
}

/// Waits until `accept` takes an inbound message or `timeout` elapses.
fn receive<T>(
    inbox: &Receiver<Inbound>,
    timeout: Duration,
    mut accept: impl FnMut(Inbound) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;

    while let Ok(inbound) = inbox.recv_deadline(deadline) {
        if let Some(accepted) = accept(inbound) {
            return Some(accepted);
        }
    }

    None
}

fn timed_out(rpc: &Rpc, to: &Contact, phase: &'static str) -> TaskError {
    debug!(id = ?to.id(), address = ?to.address(), phase, "Session timed out");
    rpc.record_failure(to.id());
    TaskError::Timeout
}

fn send_failed(rpc: &Rpc, to: &Contact, error: TaskError) -> TaskError {
    debug!(id = ?to.id(), address = ?to.address(), ?error, "Session aborted");
    rpc.record_failure(to.id());
    error
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified.
fn compare_socket_addr(a: &SocketAddr, b: &SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[cfg(test)]
mod test {
    use crate::common::{Liveness, SelectMode};
    use crate::identity::{random_signing_key, Issuer};
    use crate::rpc::Config;
    use crate::security::Ed25519Security;
    use crate::storage::MemoryStorage;

    use super::*;

    fn rpc(config: Config) -> Arc<Rpc> {
        let issuer = Issuer::random();
        let key = random_signing_key();
        let token = issuer.issue("alice", key.verifying_key().to_bytes(), Duration::from_secs(60));
        let security = Ed25519Security::new(key, token, issuer.public_key()).unwrap();

        Rpc::new(
            config,
            Box::new(security),
            Arc::new(MemoryStorage::new()),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        )
        .unwrap()
    }

    #[test]
    fn unspecified_ip_matches_any_host() {
        let unspecified: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        let localhost: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let other_port: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        assert!(compare_socket_addr(&unspecified, &localhost));
        assert!(compare_socket_addr(&localhost, &localhost));
        assert!(!compare_socket_addr(&localhost, &other_port));
        assert!(!compare_socket_addr(&localhost, &unspecified));
    }

    #[test]
    fn receive_skips_rejected_messages() {
        let (sender, inbox) = flume::unbounded();
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        for session_id in 1..=3 {
            sender
                .send(Inbound {
                    message: Message::Nonce(NonceMessage {
                        is_response: true,
                        session_id,
                        sender: Id::random(),
                        nonce: random_nonce(),
                    }),
                    from,
                })
                .unwrap();
        }

        let accepted = receive(&inbox, Duration::from_millis(50), |inbound| {
            (inbound.message.session_id() == 2).then_some(inbound.message.session_id())
        });
        assert_eq!(accepted, Some(2));

        let rest = receive(&inbox, Duration::from_millis(20), |_| Some(()));
        assert_eq!(rest, Some(()));
        assert_eq!(receive(&inbox, Duration::from_millis(20), |_| Some(())), None);
    }

    #[test]
    fn failed_send_counts_as_failure() {
        let rpc = rpc(Config::default());
        // An IPv4 socket cannot reach an IPv6 address.
        let unreachable = Contact::new(Id::random(), "[::1]:4000".parse().unwrap());
        rpc.routing_table().add(unreachable.clone());

        for _ in 0..rpc.config().max_accept_node_failures {
            assert!(matches!(rpc.ping(&unreachable), Err(TaskError::Send(_))));
        }

        let contact = rpc.routing_table().get(unreachable.id()).unwrap();
        assert_eq!(contact.liveness(), Liveness::Dead);
        assert!(rpc
            .routing_table()
            .select(unreachable.id(), 20, SelectMode::Alive)
            .is_empty());
    }
}
