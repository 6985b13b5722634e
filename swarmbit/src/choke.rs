use std::time::Duration;

use crate::{PeerKey, PeerSession};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Decides which peers we serve. Consulted on a fixed interval, never per message.
pub trait ChokePolicy: Send {
    /// Peers that should be unchoked now.
    fn decide(&mut self, peers: &[PeerSession]) -> Vec<PeerKey>;

    fn refresh_interval(&self) -> Duration;
}

/// Unchokes every interested peer, there is no limit on the number of unchoked peers.
#[derive(Debug, Clone)]
pub struct InterestedUnchoke {
    refresh_interval: Duration,
}

impl Default for InterestedUnchoke {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl InterestedUnchoke {
    pub fn with_refresh_interval(refresh_interval: Duration) -> Self {
        Self { refresh_interval }
    }
}

impl ChokePolicy for InterestedUnchoke {
    fn decide(&mut self, peers: &[PeerSession]) -> Vec<PeerKey> {
        peers
            .iter()
            .filter(|peer| {
                let flags = peer.flags();
                flags.peer_interested && flags.am_choking
            })
            .map(|peer| peer.key())
            .collect()
    }

    fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }
}
