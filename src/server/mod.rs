//! TCP front door: accepts client connections and hands each one to the relay.

pub mod listener;
