//! Engine-level scenarios and the in-memory transport they run against.

pub mod mock_transport;
