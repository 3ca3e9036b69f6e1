//! Cluster delegation: run ownership lives on one instance, peers reach
//! it through [`client::HttpDelegate`] and it answers via [`server`].

pub mod client;
pub mod server;

pub use client::{
    delegate_for, ApiResponse, HttpDelegate, LocalDelegate, RunDelegate, StartRequest,
    StopRequest,
};
pub use server::{router, serve, AppState};
