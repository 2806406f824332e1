//! Operator credentials for the check-in backend.

pub mod session;

pub use session::{Session, SessionData};
