//! Integration test support for Tern.
//!
//! [`backend::MemoryBackend`] is an in-memory ledger behind the
//! [`BackendApi`](tern_transport::BackendApi) seam; [`tls::TestServer`] is a
//! real TLS endpoint with a throwaway CA for exercising certificate pinning.

pub mod backend;
pub mod tls;
