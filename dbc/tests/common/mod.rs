pub mod assertions;
pub mod fixtures;
pub mod logging;
pub mod mocks;

pub use assertions::assert_contains;
pub use fixtures::TraceFixture;
pub use logging::init_test_logging;
