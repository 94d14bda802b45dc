//! CLI command implementations.
//!
//! | Module    | Commands handled                                             |
//! |-----------|--------------------------------------------------------------|
//! | `queue`   | `Enqueue`, `Status`, `Dispatch`, `Complete`, `Fail`, `Cancel`, `CancelGroup` |
//! | `serve`   | `Serve`, `Reconcile`                                         |
//! | `config`  | `Config`                                                     |

pub mod config;
pub mod queue;
pub mod serve;

pub use config::{cmd_config, cmd_config_init};
pub use queue::{
    cmd_cancel, cmd_cancel_group, cmd_complete, cmd_dispatch, cmd_enqueue, cmd_fail, cmd_status,
};
pub use serve::{cmd_reconcile, cmd_serve};
