//! Types and helpers shared between the Tether client and services speaking its protocol.
pub mod display;
pub mod dto;
pub mod keys;
