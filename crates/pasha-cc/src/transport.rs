//! In-process message transport between hosts.
//!
//! Each host has one request queue shared by its workers. Each worker has
//! its own response queue.

use crate::message::{Envelope, Request, Response};
use crossbeam_channel::{unbounded, Receiver, Sender};
use pasha_common::{HostId, PashaError, Result, WorkerId};
use tracing::trace;

pub struct Transport {
    worker_num: u32,
    requests: Vec<(Sender<Envelope<Request>>, Receiver<Envelope<Request>>)>,
    responses: Vec<(Sender<Envelope<Response>>, Receiver<Envelope<Response>>)>,
}

impl Transport {
    pub fn new(host_num: u32, worker_num: u32) -> Self {
        Self {
            worker_num,
            requests: (0..host_num).map(|_| unbounded()).collect(),
            responses: (0..host_num * worker_num).map(|_| unbounded()).collect(),
        }
    }

    /// Host a worker runs on.
    #[inline]
    pub fn host_of(&self, worker: WorkerId) -> HostId {
        HostId(worker.0 / self.worker_num)
    }

    /// Global id of a host's `local`-th worker.
    #[inline]
    pub fn worker_id(&self, host: HostId, local: u32) -> WorkerId {
        WorkerId(host.0 * self.worker_num + local)
    }

    pub fn send_request(&self, to: HostId, envelope: Envelope<Request>) -> Result<()> {
        trace!(from = %envelope.from, %to, txn = envelope.txn_id, "request");
        let (tx, _) = self
            .requests
            .get(to.index())
            .ok_or_else(|| PashaError::TransportDisconnected(format!("no host {to}")))?;
        tx.send(envelope)
            .map_err(|_| PashaError::TransportDisconnected(format!("request queue of {to} closed")))
    }

    pub fn send_response(&self, to: WorkerId, envelope: Envelope<Response>) -> Result<()> {
        trace!(from = %envelope.from, %to, txn = envelope.txn_id, "response");
        let (tx, _) = self
            .responses
            .get(to.index())
            .ok_or_else(|| PashaError::TransportDisconnected(format!("no worker {to}")))?;
        tx.send(envelope)
            .map_err(|_| PashaError::TransportDisconnected(format!("response queue of {to} closed")))
    }

    /// # Panics
    ///
    /// Panics if the host does not exist.
    pub fn request_receiver(&self, host: HostId) -> Receiver<Envelope<Request>> {
        self.requests[host.index()].1.clone()
    }

    /// # Panics
    ///
    /// Panics if the worker does not exist.
    pub fn response_receiver(&self, worker: WorkerId) -> Receiver<Envelope<Response>> {
        self.responses[worker.index()].1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pasha_common::{PartitionId, TableId};

    #[test]
    fn test_worker_ids_are_global() {
        let transport = Transport::new(3, 4);
        assert_eq!(transport.worker_id(HostId(2), 1), WorkerId(9));
        assert_eq!(transport.host_of(WorkerId(9)), HostId(2));
        assert_eq!(transport.host_of(WorkerId(3)), HostId(0));
    }

    #[test]
    fn test_requests_reach_every_worker_of_host() {
        let transport = Transport::new(2, 2);
        let a = transport.request_receiver(HostId(1));
        let b = transport.request_receiver(HostId(1));
        for txn_id in 0..2 {
            transport
                .send_request(
                    HostId(1),
                    Envelope {
                        from: WorkerId(0),
                        txn_id,
                        body: Request::RemoteDelete {
                            table: TableId(0),
                            partition: PartitionId(1),
                            key: 5,
                        },
                    },
                )
                .unwrap();
        }
        assert_eq!(a.recv().unwrap().txn_id, 0);
        assert_eq!(b.recv().unwrap().txn_id, 1);
        assert!(transport.request_receiver(HostId(0)).is_empty());
    }

    #[test]
    fn test_unknown_destination_is_an_error() {
        let transport = Transport::new(1, 1);
        let err = transport
            .send_response(
                WorkerId(4),
                Envelope {
                    from: WorkerId(0),
                    txn_id: 0,
                    body: Response::RemoteInsert { slot: 0, handle: None },
                },
            )
            .unwrap_err();
        assert!(matches!(err, PashaError::TransportDisconnected(_)));
    }
}
