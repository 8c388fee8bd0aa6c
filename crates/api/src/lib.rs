//! HTTP API: server, routing, and request/response mapping onto the engine.

pub mod app;
