//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `init`   | `Init`           |
//! | `watch`  | `Watch`          |
//! | `config` | `Config`         |

pub mod config;
pub mod init;
pub mod serve;
pub mod watch;

pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::{ServeOverrides, cmd_serve};
pub use watch::{WatchOverrides, cmd_watch};
