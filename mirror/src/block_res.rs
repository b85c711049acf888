// Copyright 2026 Tandem Contributors
use bytes::Bytes;
use tokio::sync::oneshot;

use tandem_common::TandemError;

/**
 * Single-use completion notifier for a write.  The dispatcher (or a
 * collaborator it hands the notifier to) consumes it exactly once; the
 * caller holds the paired [`IoWaiter`].
 */
#[must_use]
#[derive(Debug)]
pub struct IoRes {
    tx: oneshot::Sender<Result<(), TandemError>>,
}

impl IoRes {
    /// Consume this IoRes and send Ok to the receiver
    pub fn send_ok(self) {
        self.send_result(Ok(()));
    }

    /// Consume this IoRes and send an Err to the receiver
    pub fn send_err(self, e: TandemError) {
        self.send_result(Err(e));
    }

    pub fn send_result(self, r: Result<(), TandemError>) {
        // A dropped waiter eats the result.
        let _ = self.tx.send(r);
    }
}

#[must_use]
pub struct IoWaiter {
    rx: oneshot::Receiver<Result<(), TandemError>>,
}

impl IoWaiter {
    /// Consume this IoWaiter and wait on the message
    pub async fn wait(self) -> Result<(), TandemError> {
        match self.rx.await {
            Ok(v) => v,
            Err(_) => Err(TandemError::RecvDisconnected),
        }
    }

    pub fn try_wait(&mut self) -> Option<Result<(), TandemError>> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(TandemError::RecvDisconnected))
            }
        }
    }
}

pub fn io_channel() -> (IoRes, IoWaiter) {
    let (tx, rx) = oneshot::channel();
    (IoRes { tx }, IoWaiter { rx })
}

/**
 * Single-use responder for a read served from the peer.  Carries the
 * fetched data back to the caller.
 */
#[must_use]
#[derive(Debug)]
pub struct ReadRes {
    tx: oneshot::Sender<Result<Bytes, TandemError>>,
}

impl ReadRes {
    pub fn send_ok(self, data: Bytes) {
        self.send_result(Ok(data));
    }

    pub fn send_err(self, e: TandemError) {
        self.send_result(Err(e));
    }

    pub fn send_result(self, r: Result<Bytes, TandemError>) {
        let _ = self.tx.send(r);
    }
}

#[must_use]
pub struct ReadWaiter {
    rx: oneshot::Receiver<Result<Bytes, TandemError>>,
}

impl ReadWaiter {
    pub async fn wait(self) -> Result<Bytes, TandemError> {
        match self.rx.await {
            Ok(v) => v,
            Err(_) => Err(TandemError::RecvDisconnected),
        }
    }

    pub fn try_wait(&mut self) -> Option<Result<Bytes, TandemError>> {
        match self.rx.try_recv() {
            Ok(v) => Some(v),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(TandemError::RecvDisconnected))
            }
        }
    }
}

pub fn read_channel() -> (ReadRes, ReadWaiter) {
    let (tx, rx) = oneshot::channel();
    (ReadRes { tx }, ReadWaiter { rx })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_iores_and_waiter() {
        let (res, waiter) = io_channel();

        res.send_ok();

        waiter.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_iores_and_waiter_err() {
        let (res, waiter) = io_channel();

        res.send_err(TandemError::NotConnected);

        assert_eq!(waiter.wait().await, Err(TandemError::NotConnected));
    }

    #[tokio::test]
    async fn test_waiter_dropped_sender() {
        let (res, waiter) = io_channel();

        drop(res);

        assert_eq!(waiter.wait().await, Err(TandemError::RecvDisconnected));
    }

    #[test]
    fn test_try_wait() {
        let (res, mut waiter) = io_channel();

        assert!(waiter.try_wait().is_none());
        res.send_ok();
        assert_eq!(waiter.try_wait(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_readres_delivers_data() {
        let (res, waiter) = read_channel();

        res.send_ok(Bytes::from_static(b"abcd"));

        assert_eq!(waiter.wait().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_readres_err() {
        let (res, waiter) = read_channel();

        res.send_err(TandemError::StaleFetch);

        assert_eq!(waiter.wait().await, Err(TandemError::StaleFetch));
    }
}
