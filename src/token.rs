//! Operation completion tokens
//!
//! Every user operation returns a [`Token`]; the engine keeps the matching
//! [`TokenHandle`] until the operation reaches its terminal packet (CONNACK,
//! PUBACK, PUBCOMP, SUBACK, UNSUBACK), the transport write completes (QoS 0),
//! or the operation fails.

use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::{Packet, ReasonCode};

/// Terminal result of a completed operation.
///
/// Broker rejections arrive here as non-success reason codes, not as errors.
#[derive(Debug, Clone)]
pub struct Ack {
    /// Reason codes accumulated across the handshake. For QoS 2 publishes
    /// this holds the PUBREC codes followed by the PUBCOMP codes; for
    /// SUBACK/UNSUBACK one code per filter.
    pub reason_codes: SmallVec<[ReasonCode; 2]>,
    /// The terminal packet, when the operation has one
    pub response: Option<Packet>,
}

impl Ack {
    /// True when every accumulated reason code is a success code
    pub fn is_success(&self) -> bool {
        self.reason_codes.iter().all(|rc| rc.is_success())
    }
}

/// Caller-side completion handle for one user operation
pub struct Token {
    rx: oneshot::Receiver<Result<Ack, ClientError>>,
}

impl Token {
    /// Wait for the operation to reach a terminal state.
    pub async fn wait(self) -> Result<Ack, ClientError> {
        self.rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// A token that is already complete, for operations that finish
    /// synchronously (e.g. disconnect while already disconnected).
    pub fn ready(result: Result<Ack, ClientError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Token { rx }
    }
}

/// Engine-side completion handle.
///
/// Accumulates reason codes across multi-step handshakes (PUBREC carries
/// codes the token keeps until PUBCOMP completes it).
pub struct TokenHandle {
    tx: Option<oneshot::Sender<Result<Ack, ClientError>>>,
    reason_codes: SmallVec<[ReasonCode; 2]>,
}

impl TokenHandle {
    /// Create a connected handle/token pair.
    pub fn pair() -> (TokenHandle, Token) {
        let (tx, rx) = oneshot::channel();
        (
            TokenHandle {
                tx: Some(tx),
                reason_codes: SmallVec::new(),
            },
            Token { rx },
        )
    }

    /// Append a reason code from an intermediate or terminal packet.
    pub fn push_reason(&mut self, code: ReasonCode) {
        self.reason_codes.push(code);
    }

    /// Append reason codes from a terminal packet carrying one per filter.
    pub fn extend_reasons(&mut self, codes: &[ReasonCode]) {
        self.reason_codes.extend_from_slice(codes);
    }

    /// Complete the token successfully with an optional response packet.
    pub fn complete(mut self, response: Option<Packet>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(Ack {
                reason_codes: std::mem::take(&mut self.reason_codes),
                response,
            }));
        }
    }

    /// Complete the token with a failure.
    pub fn fail(mut self, err: ClientError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Whether the caller has dropped its token.
    pub fn is_abandoned(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_completes_with_accumulated_reasons() {
        let (mut handle, token) = TokenHandle::pair();
        handle.push_reason(ReasonCode::Success);
        handle.push_reason(ReasonCode::GrantedQoS2);
        handle.complete(None);

        let ack = token.wait().await.unwrap();
        assert_eq!(
            ack.reason_codes.as_slice(),
            &[ReasonCode::Success, ReasonCode::GrantedQoS2]
        );
        assert!(ack.is_success());
    }

    #[tokio::test]
    async fn test_token_fails() {
        let (handle, token) = TokenHandle::pair();
        handle.fail(ClientError::NotConnected);
        assert!(matches!(
            token.wait().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_reports_closed() {
        let (handle, token) = TokenHandle::pair();
        drop(handle);
        assert!(matches!(token.wait().await, Err(ClientError::Closed)));
    }
}
