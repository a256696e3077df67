//! Eventually consistent replicated state, gossip and leases

pub mod gossip;
pub mod lease;
pub mod outbox;
pub mod state;
pub mod version;

pub use gossip::{
    AntiEntropy, GossipMessage, GossipReply, LocalTransport, PeerTransport, RoundObserver, RoundReport,
};
pub use lease::{Lease, LeaseArbiter, LeaseManager};
pub use outbox::Outbox;
pub use state::{
    keys, merge, CasOutcome, ConflictRecord, ConflictSink, DistributedState, MergeResult, StateEntry,
};
pub use version::{Causality, Dot, VersionVector};
