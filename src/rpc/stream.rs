//! Streaming call abstraction.
//!
//! Streaming interceptors cannot hand a new request value down the chain,
//! so they replace the stream's [`RequestState`] instead. [`wrap_stream`]
//! does that in place when the stream supports it and otherwise wraps it.

use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::Frame;
use tokio::sync::mpsc;
use tonic::Status;

use super::codec;
use crate::auth::RequestState;

/// One side of a streaming call as seen by handlers and interceptors.
#[async_trait]
pub trait ServerStream: Send {
    /// State of the call as of the last interceptor that replaced it.
    fn state(&self) -> &RequestState;

    /// Next message from the client, `None` once the client half-closes.
    async fn recv(&mut self) -> Result<Option<Bytes>, Status>;

    /// Send one message to the client.
    async fn send(&mut self, message: Bytes) -> Result<(), Status>;

    /// Replace the state in place. Streams that cannot return it back.
    fn set_state(&mut self, state: RequestState) -> Result<(), RequestState> {
        Err(state)
    }
}

pub type BoxStream = Box<dyn ServerStream>;

/// A stream whose state has been overridden. Messages go to the inner stream.
pub struct WrappedStream {
    inner: BoxStream,
    state: RequestState,
}

#[async_trait]
impl ServerStream for WrappedStream {
    fn state(&self) -> &RequestState {
        &self.state
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        self.inner.recv().await
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.inner.send(message).await
    }

    fn set_state(&mut self, state: RequestState) -> Result<(), RequestState> {
        self.state = state;
        Ok(())
    }
}

/// Make `state` the state seen by everything downstream of the caller.
pub fn wrap_stream(mut stream: BoxStream, state: RequestState) -> BoxStream {
    match stream.set_state(state) {
        Ok(()) => stream,
        Err(state) => Box::new(WrappedStream {
            inner: stream,
            state,
        }),
    }
}

/// Transport-backed stream used by the RPC server.
pub struct ChannelStream {
    state: RequestState,
    incoming: mpsc::Receiver<Result<Bytes, Status>>,
    outgoing: mpsc::Sender<Frame<Bytes>>,
    max_message_size: usize,
}

impl ChannelStream {
    pub fn new(
        state: RequestState,
        incoming: mpsc::Receiver<Result<Bytes, Status>>,
        outgoing: mpsc::Sender<Frame<Bytes>>,
        max_message_size: usize,
    ) -> Self {
        Self {
            state,
            incoming,
            outgoing,
            max_message_size,
        }
    }
}

#[async_trait]
impl ServerStream for ChannelStream {
    fn state(&self) -> &RequestState {
        &self.state
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        self.incoming.recv().await.transpose()
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        let framed = codec::encode(&message, self.max_message_size)?;
        self.outgoing
            .send(Frame::data(framed))
            .await
            .map_err(|_| Status::cancelled("client closed the stream"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticated, Claims};
    use std::sync::Arc;

    fn channel_stream() -> (
        BoxStream,
        mpsc::Sender<Result<Bytes, Status>>,
        mpsc::Receiver<Frame<Bytes>>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(4);
        let stream = ChannelStream::new(RequestState::default(), in_rx, out_tx, 16);
        (Box::new(stream), in_tx, out_rx)
    }

    fn alice() -> RequestState {
        RequestState::default().with_authenticated(Authenticated {
            subject: "alice".into(),
            claims: Arc::new(Claims::default()),
        })
    }

    #[tokio::test]
    async fn wrapping_overrides_state_and_delegates_io() {
        let (stream, in_tx, mut out_rx) = channel_stream();
        let mut stream = wrap_stream(stream, alice());
        assert_eq!(stream.state().current_user(), "alice");

        in_tx.send(Ok(Bytes::from_static(b"ping"))).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().unwrap(), "ping");

        stream.send(Bytes::from_static(b"pong")).await.unwrap();
        let frame = out_rx.recv().await.unwrap().into_data().unwrap();
        assert_eq!(&frame[..], &codec::frame(b"pong")[..]);

        drop(in_tx);
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_send_fails_without_writing() {
        let (mut stream, _in_tx, mut out_rx) = channel_stream();
        let err = stream.send(Bytes::from(vec![0u8; 17])).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rewrapping_replaces_state_in_place() {
        let (stream, _in_tx, _out_rx) = channel_stream();
        let stream = wrap_stream(stream, alice());
        let bob = RequestState::default().with_authenticated(Authenticated {
            subject: "bob".into(),
            claims: Arc::new(Claims::default()),
        });
        let mut stream = wrap_stream(stream, bob);
        assert_eq!(stream.state().current_user(), "bob");
        // Still a single layer: setting state succeeds directly.
        assert!(stream.set_state(RequestState::default()).is_ok());
    }
}
