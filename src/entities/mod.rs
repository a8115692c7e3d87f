// Entity Models
//
// Two node kinds and one edge kind:
// - Profile (customer-like, filtered by country)
// - Store (merchant-like, the aggregation target)
// - Purchase (Profile → Store, timestamped and weighted)

pub mod profile;
pub mod store;
pub mod purchase;

pub use profile::Profile;
pub use store::Store;
pub use purchase::{compute_import_key, from_micros, parse_when, Purchase};
