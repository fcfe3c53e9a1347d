pub mod batch;
pub mod infra;
pub mod ledger;
pub mod resolver;
pub mod sources;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use batch::{BatchOrchestrator, Budget, ChainFactory, Concurrency, RateLimitScope, RunOptions, RunStats};
pub use ledger::{Ledger, LedgerDelta};
pub use resolver::{FallbackResolver, ResolveReport, Resolution};
pub use sources::SourceKind;
pub use store::RecordStore;
pub use traits::{AddressResolver, CoordinateSource, PageFetcher};
