pub use tokio::test as async_test;
