//! Bulk-loaded index tree over leaf data pages.
//!
//! The tree is written once, in key order, and never modified afterwards:
//!
//! ```text
//! append_page(k0, p0) ... append_page(k9, p9), finalize   (fanout 3)
//!
//!                        [k0 | k9]                       level 2, root page fixed
//!                       /         \
//!            [k0 | k3 | k6]        [k9]                  level 1
//!           /      |      \          \
//! [k0 k1 k2] [k3 k4 k5] [k6 k7 k8]   [k9]                level 0 -> data pages
//! ```
//!
//! Only the rightmost node of each level is open while building. Every level
//! uses the same node format (see [`node`]), and every entry key is the
//! inclusive lower bound of its pointer's range.

pub mod constants;
pub mod internal_nodes;
pub mod iterator;
pub mod node;

pub use constants::{MAX_DEPTH, MAX_KEY_SIZE};
pub use internal_nodes::{InternalNodes, TreeSummary};
pub use iterator::{IndexEntry, IndexIterator};
pub use node::{IndexNode, NodeHeader};
