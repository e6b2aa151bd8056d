mod client;
mod dap_session;
mod launch;

pub use client::{start_adapter, start_adapter_with_config, TestAdapter};
