//! User accounts.
//!
//! Every task a person submits belongs to a user; the scheduler keeps one
//! system account of its own for the tasks it creates (maintenance and
//! calibration runs). Passwords are stored as salted SHA-256 digests.

mod user_store;

pub use user_store::{SYSTEM_USER, UserStore, hash_password};
