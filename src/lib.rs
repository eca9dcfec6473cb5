pub mod api;
pub mod calls;
pub mod transport;
pub mod types;

// Mock collaborators shared between unit and integration tests.
pub mod test_utils;
