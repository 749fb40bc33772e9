//! # transport
//!
//! why: move consensus messages between members, best effort, without blocking the driver
//! relations: driver.rs sends every Ready's messages here; receivers feed NodeHandle::mailbox;
//! addresses come from membership.rs
//! what: Transport trait, MemoryNetwork (in-process routing), MemoryTransport

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Envelope;
use crate::membership::MembershipTable;

/// Outbound message delivery
///
/// messages may be dropped, delayed or reordered; the engine retries as needed
pub trait Transport: Send + Sync + 'static {
    fn send(&self, messages: Vec<Envelope>);
}

#[derive(Default)]
struct Routes {
    mailboxes: HashMap<String, mpsc::Sender<Envelope>>,
    /// addresses whose traffic is dropped in both directions
    isolated: HashSet<String>,
}

/// In-process network: address -> node mailbox
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// route messages for `address` into a node's mailbox
    pub fn register(&self, address: impl Into<String>, mailbox: mpsc::Sender<Envelope>) {
        self.lock().mailboxes.insert(address.into(), mailbox);
    }

    pub fn unregister(&self, address: &str) {
        self.lock().mailboxes.remove(address);
    }

    /// drop all traffic to and from an address until healed
    pub fn isolate(&self, address: impl Into<String>) {
        self.lock().isolated.insert(address.into());
    }

    pub fn heal(&self, address: &str) {
        self.lock().isolated.remove(address);
    }

    /// a sender bound to one node's view of the membership
    pub fn transport(&self, membership: MembershipTable) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            membership,
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    membership: MembershipTable,
}

impl Transport for MemoryTransport {
    fn send(&self, messages: Vec<Envelope>) {
        let routes = self.network.lock();
        for message in messages {
            let Some(address) = self.membership.address(message.to) else {
                debug!(to = message.to, "no address for member, dropping message");
                continue;
            };
            let from_isolated = self
                .membership
                .address(message.from)
                .is_some_and(|from| routes.isolated.contains(&from));
            if from_isolated || routes.isolated.contains(&address) {
                continue;
            }
            let Some(mailbox) = routes.mailboxes.get(&address) else {
                debug!(to = message.to, %address, "member unreachable, dropping message");
                continue;
            };
            if let Err(e) = mailbox.try_send(message) {
                debug!(%address, error = %e, "mailbox rejected message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: u64, to: u64) -> Envelope {
        Envelope {
            from,
            to,
            payload: vec![from as u8, to as u8],
        }
    }

    fn table(ids: &[u64]) -> MembershipTable {
        let table = MembershipTable::new();
        for id in ids {
            table.insert(*id, &format!("mem://{id}"));
        }
        table
    }

    #[tokio::test]
    async fn routes_by_member_address() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::channel(4);
        network.register("mem://2", tx);
        let transport = network.transport(table(&[1, 2]));

        transport.send(vec![envelope(1, 2), envelope(1, 3)]);

        assert_eq!(rx.recv().await, Some(envelope(1, 2)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_mailbox_drops_instead_of_blocking() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::channel(1);
        network.register("mem://2", tx);
        let transport = network.transport(table(&[1, 2]));

        transport.send(vec![envelope(1, 2), envelope(1, 2)]);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn isolated_member_neither_sends_nor_receives() {
        let network = MemoryNetwork::new();
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        network.register("mem://2", tx2);
        network.register("mem://3", tx3);
        let transport = network.transport(table(&[1, 2, 3]));

        network.isolate("mem://1");
        transport.send(vec![envelope(1, 2)]);
        network.heal("mem://1");
        network.isolate("mem://3");
        transport.send(vec![envelope(1, 2), envelope(1, 3)]);

        assert_eq!(rx2.recv().await, Some(envelope(1, 2)));
        assert!(rx2.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
    }
}
