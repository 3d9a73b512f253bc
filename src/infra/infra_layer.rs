// The infra module contains implementations of core traits.
// Each backend gets its own submodule.

#[path = "broker/mod.rs"]
pub mod broker;

#[path = "store/mod.rs"]
pub mod store;
