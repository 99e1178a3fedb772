//! # sema-analysis
//!
//! The semantic half of the contract-summary pipeline. Where `sema-lift`
//! turns bytecode into per-path three-address code, this crate recovers
//! what the code *means*:
//!
//! - [`tree`]: expression trees rebuilt from def-use chains, with the
//!   `cstates` check-bits that drive guard classification
//! - [`storage`]: the storage-variable analyzer — slot indices, map/array
//!   keys, packed byte windows, recovered types
//! - [`extract`]: the semantic-unit extractor over one lifted path
//! - [`solver`]: the integer-approximation feasibility checker pruning
//!   contradictory paths
//! - [`functions`]: dispatcher recognition and path-to-function attribution
//! - [`post`]: merging of dynamic-value stores, array `PUSH` recovery,
//!   guard pruning
//! - [`pipeline`]: the static and transaction entry points, file formats
//!   included
//! - [`graph`] / [`describe`]: downstream faces over the NDJSON output

pub mod describe;
pub mod errors;
pub mod extract;
pub mod functions;
pub mod graph;
pub mod pipeline;
pub mod post;
pub mod render;
pub mod sha3;
pub mod solver;
pub mod state_vars;
pub mod storage;
pub mod tree;
pub mod types;
pub mod units;
pub mod vars;
