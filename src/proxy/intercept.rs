//! Request interception and operator decisions

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

use super::request::ProxyRequest;

/// Decision made by the operator for a paused request
#[derive(Debug)]
pub enum InterceptDecision {
    /// Send the (possibly edited) request upstream
    Forward(ProxyRequest),
    /// Answer the client with a fixed "dropped" response
    Drop,
}

/// Sender half held in the paused index
pub(crate) type DecisionSender = oneshot::Sender<InterceptDecision>;

/// Receiver half held by the connection task
pub(crate) type DecisionReceiver = oneshot::Receiver<InterceptDecision>;

/// Outcome of waiting on a paused request
#[derive(Debug)]
pub(crate) enum Wait {
    Decided(InterceptDecision),
    /// The client hung up while paused
    ClientClosed,
    /// The paused index dropped the sender
    Abandoned,
}

/// Wait for a decision while watching the client for a hang-up.
///
/// Bytes the client sends while paused are discarded; the connection is
/// closed after this exchange anyway.
pub(crate) async fn await_decision<R>(mut rx: DecisionReceiver, client: &mut R) -> Wait
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            decision = &mut rx => {
                return match decision {
                    Ok(decision) => Wait::Decided(decision),
                    Err(_) => Wait::Abandoned,
                };
            }
            read = client.read(&mut scratch) => {
                match read {
                    Ok(0) | Err(_) => {
                        // A decision may have landed in the same instant
                        rx.close();
                        return match rx.try_recv() {
                            Ok(decision) => Wait::Decided(decision),
                            Err(_) => Wait::ClientClosed,
                        };
                    }
                    Ok(n) => {
                        tracing::trace!("Discarding {} bytes sent while paused", n);
                    }
                }
            }
        }
    }
}

/// Create the channel for a newly paused request
pub(crate) fn decision_channel() -> (DecisionSender, DecisionReceiver) {
    oneshot::channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    #[tokio::test]
    async fn test_decision_delivered() {
        let (tx, rx) = decision_channel();
        let (mut client, _peer) = tokio::io::duplex(64);

        let request = ProxyRequest::new("GET", "http://example.com/", Headers::new());
        tx.send(InterceptDecision::Forward(request.clone())).unwrap();

        match await_decision(rx, &mut client).await {
            Wait::Decided(InterceptDecision::Forward(r)) => assert_eq!(r.id, request.id),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_hangup_detected() {
        let (_tx, rx) = decision_channel();
        let (mut client, peer) = tokio::io::duplex(64);
        drop(peer);

        assert!(matches!(await_decision(rx, &mut client).await, Wait::ClientClosed));
    }

    #[tokio::test]
    async fn test_sender_dropped() {
        let (tx, rx) = decision_channel();
        let (mut client, _peer) = tokio::io::duplex(64);
        drop(tx);

        assert!(matches!(await_decision(rx, &mut client).await, Wait::Abandoned));
    }

    #[tokio::test]
    async fn test_send_fails_after_hangup() {
        let (tx, rx) = decision_channel();
        let (mut client, peer) = tokio::io::duplex(64);
        drop(peer);

        assert!(matches!(await_decision(rx, &mut client).await, Wait::ClientClosed));
        assert!(tx.send(InterceptDecision::Drop).is_err());
    }
}
