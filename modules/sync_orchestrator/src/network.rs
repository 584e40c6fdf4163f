//! Request/response pairing over a peer's event stream
//!
//! A peer source consumes [`PeerRequest`]s and produces [`PeerEvent`]s. The
//! [`PeerClient`] keeps a map of outstanding requests keyed by what they ask
//! for; a dispatcher task completes them as matching events arrive and
//! forwards everything else as an unsolicited announcement. Requests are
//! resent on a fixed interval until answered. Headers answers echo the
//! locator they follow, so a late answer to an earlier request is dropped.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{BlockHash, BlockHeader, TxId};
use tokio::sync::{mpsc, oneshot};
use tokio::{select, time};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    Headers {
        locator: Vec<BlockHash>,
        limit: usize,
    },
    Block {
        hash: BlockHash,
    },
    Transaction {
        txid: TxId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inventory {
    Block(BlockHash),
    Transaction(TxId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Headers {
        locator: Vec<BlockHash>,
        headers: Vec<BlockHeader>,
    },
    Block { hash: BlockHash, raw: Vec<u8> },
    Transaction { txid: TxId, raw: Vec<u8> },
    /// Hashes a peer has and we may not
    Inventory(Vec<Inventory>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RequestKey {
    Headers(Vec<BlockHash>),
    Block(BlockHash),
    Transaction(TxId),
}

type PendingMap = DashMap<RequestKey, oneshot::Sender<PeerEvent>>;

/// The source's half of a peer connection
pub struct PeerEndpoint {
    pub requests: mpsc::UnboundedReceiver<PeerRequest>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

#[derive(Clone)]
pub struct PeerClient {
    requests: mpsc::UnboundedSender<PeerRequest>,
    pending: Arc<PendingMap>,
    retry_interval: Duration,
}

impl PeerClient {
    /// Create a client, the endpoint a peer source should serve, and the
    /// stream of events that answered no request.
    ///
    /// Spawns the dispatcher, so must be called inside a runtime.
    pub fn connect(
        retry_interval: Duration,
    ) -> (Self, PeerEndpoint, mpsc::UnboundedReceiver<PeerEvent>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingMap::new());

        tokio::spawn(dispatch(events_rx, pending.clone(), announce_tx));

        let client = Self {
            requests: requests_tx,
            pending,
            retry_interval,
        };
        let endpoint = PeerEndpoint {
            requests: requests_rx,
            events: events_tx,
        };
        (client, endpoint, announce_rx)
    }

    pub async fn get_headers(
        &self,
        locator: Vec<BlockHash>,
        limit: usize,
    ) -> Result<Vec<BlockHeader>> {
        let key = RequestKey::Headers(locator.clone());
        match self.request(key, PeerRequest::Headers { locator, limit }).await? {
            PeerEvent::Headers { headers, .. } => Ok(headers),
            other => Err(anyhow!("Unexpected answer to headers request: {other:?}")),
        }
    }

    pub async fn get_block(&self, hash: &str) -> Result<Vec<u8>> {
        let key = RequestKey::Block(hash.to_string());
        let request = PeerRequest::Block {
            hash: hash.to_string(),
        };
        match self.request(key, request).await? {
            PeerEvent::Block { raw, .. } => Ok(raw),
            other => Err(anyhow!("Unexpected answer to block request: {other:?}")),
        }
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        let key = RequestKey::Transaction(txid.to_string());
        let request = PeerRequest::Transaction {
            txid: txid.to_string(),
        };
        match self.request(key, request).await? {
            PeerEvent::Transaction { raw, .. } => Ok(raw),
            other => Err(anyhow!("Unexpected answer to transaction request: {other:?}")),
        }
    }

    /// Number of requests still waiting for an answer
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn request(&self, key: RequestKey, request: PeerRequest) -> Result<PeerEvent> {
        let (done, mut answer) = oneshot::channel();
        self.pending.insert(key.clone(), done);

        let mut retry = time::interval(self.retry_interval);
        let result = loop {
            select! {
                event = &mut answer => {
                    break event.map_err(|_| anyhow!("peer connection closed"));
                }
                _ = retry.tick() => {
                    debug!("Sending {request:?}");
                    if self.requests.send(request.clone()).is_err() {
                        break Err(anyhow!("peer source has disconnected"));
                    }
                }
            }
        };
        self.pending.remove(&key);
        result
    }
}

async fn dispatch(
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    pending: Arc<PendingMap>,
    announcements: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some(event) = events.recv().await {
        let key = match &event {
            PeerEvent::Headers { locator, .. } => Some(RequestKey::Headers(locator.clone())),
            PeerEvent::Block { hash, .. } => Some(RequestKey::Block(hash.clone())),
            PeerEvent::Transaction { txid, .. } => Some(RequestKey::Transaction(txid.clone())),
            PeerEvent::Inventory(_) => None,
        };
        let waiter = key.and_then(|key| pending.remove(&key)).map(|(_, waiter)| waiter);
        let unanswered = match waiter {
            Some(waiter) => waiter.send(event).err(),
            None => Some(event),
        };
        if let Some(event) = unanswered {
            if matches!(event, PeerEvent::Headers { .. }) {
                debug!("Dropping unrequested headers");
                continue;
            }
            if announcements.send(event).is_err() {
                warn!("Announcement receiver dropped, stopping peer dispatcher");
                return;
            }
        }
    }
    // Dropping the waiters fails every outstanding request
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(n: u8) -> BlockHeader {
        BlockHeader {
            hash: format!("{n:02x}"),
            previous_block_hash: format!("{:02x}", n.wrapping_sub(1)),
        }
    }

    #[tokio::test]
    async fn answers_complete_matching_requests() {
        let (client, mut endpoint, _announcements) = PeerClient::connect(Duration::from_secs(60));

        let source = tokio::spawn(async move {
            while let Some(request) = endpoint.requests.recv().await {
                let event = match request {
                    PeerRequest::Headers { locator, .. } => PeerEvent::Headers {
                        locator,
                        headers: vec![header(1)],
                    },
                    PeerRequest::Block { hash } => PeerEvent::Block {
                        hash,
                        raw: vec![1, 2, 3],
                    },
                    PeerRequest::Transaction { txid } => PeerEvent::Transaction {
                        txid,
                        raw: vec![9],
                    },
                };
                endpoint.events.send(event).unwrap();
            }
        });

        assert_eq!(client.get_headers(vec![], 10).await.unwrap(), vec![header(1)]);
        assert_eq!(client.get_block("aa").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(client.get_transaction("t").await.unwrap(), vec![9]);
        assert_eq!(client.pending(), 0);

        drop(client);
        source.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_requests_are_resent() {
        let (client, mut endpoint, _announcements) = PeerClient::connect(Duration::from_millis(10));

        let source = tokio::spawn(async move {
            // Ignore the first two sends, answer the third
            for _ in 0..2 {
                endpoint.requests.recv().await.unwrap();
            }
            let request = endpoint.requests.recv().await.unwrap();
            assert_eq!(
                request,
                PeerRequest::Block {
                    hash: "bb".to_string()
                }
            );
            endpoint
                .events
                .send(PeerEvent::Block {
                    hash: "bb".to_string(),
                    raw: vec![7],
                })
                .unwrap();
            endpoint
        });

        assert_eq!(client.get_block("bb").await.unwrap(), vec![7]);
        source.await.unwrap();
    }

    #[tokio::test]
    async fn unsolicited_events_become_announcements() {
        let (client, endpoint, mut announcements) = PeerClient::connect(Duration::from_secs(60));

        let inventory = PeerEvent::Inventory(vec![Inventory::Block("cc".to_string())]);
        let stray = PeerEvent::Headers {
            locator: vec![],
            headers: vec![header(2)],
        };
        endpoint.events.send(stray).unwrap();
        endpoint.events.send(inventory.clone()).unwrap();
        let block = PeerEvent::Block {
            hash: "dd".to_string(),
            raw: vec![],
        };
        endpoint.events.send(block.clone()).unwrap();

        assert_eq!(announcements.recv().await.unwrap(), inventory);
        assert_eq!(announcements.recv().await.unwrap(), block);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn late_headers_answer_does_not_satisfy_a_newer_request() {
        let (client, mut endpoint, _announcements) = PeerClient::connect(Duration::from_secs(60));

        let source = tokio::spawn(async move {
            let request = endpoint.requests.recv().await.unwrap();
            assert_eq!(
                request,
                PeerRequest::Headers {
                    locator: vec!["02".to_string()],
                    limit: 10
                }
            );
            // A duplicate answer to an older locator arrives first
            let stale = PeerEvent::Headers {
                locator: vec!["01".to_string()],
                headers: vec![header(2)],
            };
            endpoint.events.send(stale).unwrap();
            let fresh = PeerEvent::Headers {
                locator: vec!["02".to_string()],
                headers: vec![header(3)],
            };
            endpoint.events.send(fresh).unwrap();
            endpoint
        });

        let headers = client.get_headers(vec!["02".to_string()], 10).await.unwrap();
        assert_eq!(headers, vec![header(3)]);
        assert_eq!(client.pending(), 0);
        source.await.unwrap();
    }

    #[tokio::test]
    async fn closed_source_fails_pending_requests() {
        let (client, endpoint, _announcements) = PeerClient::connect(Duration::from_secs(60));
        drop(endpoint);

        assert!(client.get_block("ee").await.is_err());
    }
}
