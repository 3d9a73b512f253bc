// The core module contains the coordination and delivery logic.
// It only talks to the outside world through the traits (ports) it defines.

#[path = "lock/mod.rs"]
pub mod lock;

#[path = "messaging/mod.rs"]
pub mod messaging;

#[path = "rate_limit/mod.rs"]
pub mod rate_limit;

#[path = "store/mod.rs"]
pub mod store;
