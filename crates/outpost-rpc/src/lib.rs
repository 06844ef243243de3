//! Local call/notify messaging between the runner's daemons.
//!
//! Each daemon role listens on a unix socket under the data root. A message is
//! a small header block (`Content-Length`, optional `Traceparent`) followed by
//! a JSON body. Every connection carries exactly one exchange.

pub mod client;
pub mod protocol;
pub mod server;
pub mod trace;
pub mod types;

pub use client::Client;
pub use protocol::{ErrorObject, Request, Response, RpcError, error_code, format_error_chain};
pub use server::{BoundServer, Server};

use std::path::{Path, PathBuf};

/// Socket path for a daemon role, e.g. `<data>/rpc@launcher`.
pub fn endpoint_path(data_root: &Path, role: &str) -> PathBuf {
    data_root.join(format!("rpc@{role}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_path_uses_role_suffix() {
        let p = endpoint_path(Path::new("/opt/outpost"), "snapshot-helper");
        assert_eq!(p, PathBuf::from("/opt/outpost/rpc@snapshot-helper"));
    }
}
