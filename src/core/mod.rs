//! The transfer protocol: framing, typed messages, dispatch, and the
//! block-oriented sender/receiver pair.

pub mod block;
pub mod dispatch;
pub mod frame;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod simple;
pub mod worker;
