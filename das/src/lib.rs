#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod availability;
mod checkpoint;
mod checkpoint_store;
mod coordinator;
pub mod daser;
pub mod fraud;
pub mod header;
mod state;
pub mod stats;
pub mod store;
mod subscriber;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod test_utils;
mod worker;

pub use crate::checkpoint::Checkpoint;
pub use crate::daser::{Daser, DaserArgs, DaserError, Parameters};
