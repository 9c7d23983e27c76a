#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod addr;
pub mod frame;
pub mod host;
pub mod persist;
pub mod queue;
pub mod relay;
pub mod session;
pub mod sms;
pub mod table;
pub mod ty;

mod util;

pub use octs;
pub use util::StrError;
