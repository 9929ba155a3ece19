//! Request/acknowledgement plumbing for one connection.
//!
//! A [`Link`] issues packet ids, sends SUBSCRIBE and UNSUBSCRIBE over its
//! connection and parks the caller until the dispatch loop hands it the
//! matching SUBACK or UNSUBACK.

use crate::config::TopicConfig;
use crate::error::{Error, ProtocolRejection, SlotFailure};
use crate::packet::{ControlPacket, SubAckCode, Subscribe, Unsubscribe};
use crate::pool::{Connection, ConnectionId};
use crate::types::QoS;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Acknowledgement routed to a waiting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ack {
    SubAck(SubAckCode),
    UnsubAck(u8),
}

pub(crate) struct Link {
    conn: Arc<dyn Connection>,
    next_pkid: AtomicU16,
    pending: Mutex<HashMap<u16, oneshot::Sender<Ack>>>,
    closed: AtomicBool,
}

impl Link {
    pub(crate) fn new(conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            next_pkid: AtomicU16::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail every pending request and refuse new ones.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = std::mem::take(&mut *self.pending.lock());
        if !dropped.is_empty() {
            debug!(connection = %self.id(), pending = dropped.len(), "link closed with requests in flight");
        }
    }

    /// Hand an acknowledgement to its waiter. Returns false if nobody waits for `pkid`.
    pub(crate) fn complete(&self, pkid: u16, ack: Ack) -> bool {
        let Some(tx) = self.pending.lock().remove(&pkid) else {
            warn!(connection = %self.id(), pkid, "acknowledgement for unknown packet id");
            return false;
        };
        tx.send(ack).is_ok()
    }

    /// Subscribe to the config's physical filter; returns the granted QoS.
    pub(crate) async fn subscribe(
        &self,
        config: &TopicConfig,
        filter: &str,
        timeout: Duration,
    ) -> Result<QoS, SlotFailure> {
        let ack = self
            .request(
                |pkid| {
                    ControlPacket::Subscribe(Subscribe {
                        pkid,
                        filter: filter.to_string(),
                        qos: config.qos(),
                        no_local: config.no_local(),
                        retain_as_published: config.retain_as_published(),
                        retain_handling: config.retain_handling(),
                    })
                },
                timeout,
            )
            .await?;

        match ack {
            Ack::SubAck(SubAckCode::Granted(qos)) => Ok(qos),
            Ack::SubAck(SubAckCode::Rejected(code)) | Ack::UnsubAck(code) => {
                Err(SlotFailure::Rejected(ProtocolRejection {
                    filter: filter.to_string(),
                    code,
                }))
            }
        }
    }

    pub(crate) async fn unsubscribe(&self, filter: &str, timeout: Duration) -> Result<(), SlotFailure> {
        let ack = self
            .request(
                |pkid| {
                    ControlPacket::Unsubscribe(Unsubscribe {
                        pkid,
                        filter: filter.to_string(),
                    })
                },
                timeout,
            )
            .await?;

        match ack {
            Ack::UnsubAck(code) if code < 0x80 => Ok(()),
            Ack::UnsubAck(code) | Ack::SubAck(SubAckCode::Rejected(code)) => {
                Err(SlotFailure::Rejected(ProtocolRejection {
                    filter: filter.to_string(),
                    code,
                }))
            }
            Ack::SubAck(SubAckCode::Granted(_)) => Err(SlotFailure::Send(
                "unexpected SUBACK for UNSUBSCRIBE".to_string(),
            )),
        }
    }

    async fn request<F>(&self, build: F, timeout: Duration) -> Result<Ack, SlotFailure>
    where
        F: FnOnce(u16) -> ControlPacket,
    {
        let (tx, rx) = oneshot::channel();
        let pkid = {
            let mut pending = self.pending.lock();
            if self.is_closed() {
                return Err(SlotFailure::ConnectionClosed);
            }
            let pkid = self.allocate(&pending)?;
            pending.insert(pkid, tx);
            pkid
        };

        let packet = build(pkid);
        debug!(connection = %self.id(), pkid, packet = packet.name(), "sending request");
        if let Err(e) = self.conn.send(packet).await {
            self.pending.lock().remove(&pkid);
            return Err(match e {
                Error::ConnectionClosed => SlotFailure::ConnectionClosed,
                e => SlotFailure::Send(e.to_string()),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SlotFailure::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&pkid);
                Err(SlotFailure::Timeout(timeout))
            }
        }
    }

    // Packet ids are non-zero and unique among requests in flight.
    fn allocate(&self, pending: &HashMap<u16, oneshot::Sender<Ack>>) -> Result<u16, SlotFailure> {
        for _ in 0..u16::MAX {
            let pkid = self.next_pkid.fetch_add(1, Ordering::Relaxed);
            if pkid != 0 && !pending.contains_key(&pkid) {
                return Ok(pkid);
            }
        }
        Err(SlotFailure::Send("no free packet id".to_string()))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("connection", &self.id())
            .field("pending", &self.pending.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct SinkConn {
        id: ConnectionId,
        sent: mpsc::UnboundedSender<ControlPacket>,
        fail_send: bool,
    }

    #[async_trait]
    impl Connection for SinkConn {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, packet: ControlPacket) -> Result<()> {
            if self.fail_send {
                return Err(Error::Connection("broken pipe".to_string()));
            }
            let _ = self.sent.send(packet);
            Ok(())
        }

        async fn recv(&self) -> Result<ControlPacket> {
            std::future::pending().await
        }
    }

    fn link(fail_send: bool) -> (Arc<Link>, mpsc::UnboundedReceiver<ControlPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(SinkConn {
            id: ConnectionId::new(1),
            sent: tx,
            fail_send,
        });
        (Link::new(conn), rx)
    }

    fn config() -> TopicConfig {
        TopicConfig::builder("a/+").qos(1).build().unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_granted() {
        let (link, mut sent) = link(false);
        let config = config();

        let task = {
            let link = link.clone();
            tokio::spawn(async move { link.subscribe(&config, "a/+", Duration::from_secs(1)).await })
        };

        let Some(ControlPacket::Subscribe(sub)) = sent.recv().await else {
            panic!("expected SUBSCRIBE");
        };
        assert_ne!(sub.pkid, 0);
        assert_eq!(sub.filter, "a/+");
        assert_eq!(sub.qos, QoS::AtLeastOnce);

        assert!(link.complete(sub.pkid, Ack::SubAck(SubAckCode::Granted(QoS::AtMostOnce))));
        assert_eq!(task.await.unwrap(), Ok(QoS::AtMostOnce));
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let (link, mut sent) = link(false);
        let config = config();

        let task = {
            let link = link.clone();
            tokio::spawn(async move { link.subscribe(&config, "a/+", Duration::from_secs(1)).await })
        };

        let Some(ControlPacket::Subscribe(sub)) = sent.recv().await else {
            panic!("expected SUBSCRIBE");
        };
        link.complete(sub.pkid, Ack::SubAck(SubAckCode::Rejected(0x87)));

        assert_eq!(
            task.await.unwrap(),
            Err(SlotFailure::Rejected(ProtocolRejection {
                filter: "a/+".to_string(),
                code: 0x87,
            }))
        );
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (link, _sent) = link(false);
        let result = link.unsubscribe("a/+", Duration::from_millis(20)).await;
        assert_eq!(result, Err(SlotFailure::Timeout(Duration::from_millis(20))));
        assert!(link.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure() {
        let (link, _sent) = link(true);
        let result = link.unsubscribe("a/+", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SlotFailure::Send(_))));
        assert!(link.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let (link, mut sent) = link(false);

        let task = {
            let link = link.clone();
            tokio::spawn(async move { link.unsubscribe("a/+", Duration::from_secs(5)).await })
        };
        sent.recv().await.unwrap();
        link.close();

        assert_eq!(task.await.unwrap(), Err(SlotFailure::ConnectionClosed));
        assert_eq!(
            link.unsubscribe("a/+", Duration::from_secs(1)).await,
            Err(SlotFailure::ConnectionClosed)
        );
    }

    #[test]
    fn test_pkid_skips_zero_and_in_flight() {
        let (link, _sent) = link(false);
        link.next_pkid.store(u16::MAX, Ordering::Relaxed);

        let mut pending = HashMap::new();
        let (tx, _rx) = oneshot::channel();
        pending.insert(1, tx);

        assert_eq!(link.allocate(&pending).unwrap(), u16::MAX);
        // Wraps past 0 and skips 1, which is in flight.
        assert_eq!(link.allocate(&pending).unwrap(), 2);
    }

    #[test]
    fn test_complete_unknown() {
        let (link, _sent) = link(false);
        assert!(!link.complete(9, Ack::UnsubAck(0)));
    }
}
