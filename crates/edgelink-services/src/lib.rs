//! edgelink-services: the edge peer's lease and membership machinery.
//!
//! `EdgePeer` is the entry point; the other modules are its parts and the
//! collaborator traits it is built on.

pub mod bootstrap;
pub mod cache;
pub mod edge;
pub mod events;
pub mod lease;
pub mod monitor;
pub mod propagate;
pub mod registry;
pub mod seeding;
pub mod transport;

pub use cache::{AdvertisementCache, CacheError, MemoryCache};
pub use edge::{EdgePeer, EdgeServices};
pub use events::{EventBus, EventSink};
pub use lease::{LeaseState, ReplyOutcome};
pub use registry::{Connection, ConnectionRegistry};
pub use seeding::{build_seeding, CacheSeeding, SeedCandidate, SeedingError, SeedingSource, UriSeeding};
pub use transport::{Destination, Transport, TransportError};
