//! Round-robin connector rotation

use std::{
    io,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;

use crate::relay::socks5::Address;

use super::{BoxedConn, Connector, Network, SharedConnector};

/// Fans dials out over a fixed set of inner connectors in round-robin order.
///
/// The counter is a plain atomic; wraparound keeps the modulus fair. A
/// failing inner connector is not retried, the error goes to the caller.
pub struct RotationConnector {
    connectors: Vec<SharedConnector>,
    robin: AtomicU32,
}

impl RotationConnector {
    pub fn new(connectors: Vec<SharedConnector>) -> RotationConnector {
        assert!(!connectors.is_empty(), "rotation requires at least one connector");
        RotationConnector {
            connectors,
            robin: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Connector for RotationConnector {
    async fn dial(&self, network: Network, addr: &Address) -> io::Result<BoxedConn> {
        let n = self.robin.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let i = n as usize % self.connectors.len();
        self.connectors[i].dial(network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    struct MockConnector {
        id: usize,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn dial(&self, _network: Network, _addr: &Address) -> io::Result<BoxedConn> {
            self.calls.lock().unwrap().push(self.id);
            let (near, _far) = tokio::io::duplex(16);
            Ok(Box::new(near))
        }
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let connectors: Vec<SharedConnector> = (0..3)
            .map(|id| {
                Arc::new(MockConnector {
                    id,
                    calls: calls.clone(),
                }) as SharedConnector
            })
            .collect();

        let rotation = RotationConnector::new(connectors);
        let addr = Address::SocketAddress("127.0.0.1:80".parse().unwrap());

        for _ in 0..300 {
            rotation.dial(Network::Tcp, &addr).await.unwrap();
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 300);
        for id in 0..3 {
            assert_eq!(calls.iter().filter(|&&c| c == id).count(), 100);
        }
        // the increment happens before the modulus, so the cycle starts at 1
        for (i, &id) in calls.iter().enumerate() {
            assert_eq!(id, (i + 1) % 3);
        }
    }
}
