//! # sema-lift
//!
//! The syntactic half of the contract-summary pipeline: from raw runtime
//! bytecode to lifted, per-path three-address code.
//!
//! ```text
//! hex bytes ──▶ disasm ──▶ cfg (blocks) ──▶ explorer (paths)
//!                                              │
//!                             per path         ▼
//!                        destackifier ──▶ TacPath (ops + variables)
//! ```
//!
//! Concrete transaction traces enter through [`trace`] and reuse the same
//! block and lifting machinery restricted to the witnessed path.
//!
//! The semantic half (expression trees, storage recovery, semantic units)
//! lives in the `sema-analysis` crate on top of these types.

pub mod cfg;
pub mod destack;
pub mod disasm;
pub mod errors;
pub mod explorer;
pub mod memory;
pub mod opcodes;
pub mod tac;
pub mod trace;
pub mod value;
