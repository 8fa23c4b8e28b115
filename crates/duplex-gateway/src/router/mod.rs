//! Resolution of inbound artifacts to contracts.
//!
//! | Channel | Router | Key |
//! |---------|--------|-----|
//! | REST | [`TrieRouter`] | method + path template |
//! | pub/sub | [`TopicRouter`] | topic pattern |

mod topic;
mod trie;

pub use topic::TopicRouter;
pub use trie::{RouteMatch, RouterError, TrieRouter};
