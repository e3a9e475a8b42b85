//! Persistence operations for the satellite estimation service

pub mod calculations;
pub mod plots;
