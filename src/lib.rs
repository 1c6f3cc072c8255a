//! WebSocket gateway for interactive SSH sessions.
//!
//! Browser clients connect over a persistent WebSocket, authenticate to a
//! remote host with a private key, and drive an interactive PTY shell while
//! issuing out-of-band commands whose results come back programmatically.

pub mod gateway;
