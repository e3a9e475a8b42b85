//! Database access layer
//!
//! Schema initialization is idempotent; every service opens the pool through
//! [`init::init_database`] so a fresh deployment needs no manual setup.

pub mod init;

pub use init::init_database;
