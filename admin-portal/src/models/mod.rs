pub mod allow_list;
pub mod identity;
pub mod verdict;

pub use allow_list::AllowListEntry;
pub use identity::{Identity, IdentityClaim, IdentitySource, RemoteSession};
pub use verdict::{DenialReason, Verdict};
