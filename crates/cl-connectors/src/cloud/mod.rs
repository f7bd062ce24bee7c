//! Cloud provider evidence collection.
//!
//! Only AWS is collected today; each provider lives in its own submodule.

pub mod aws;
