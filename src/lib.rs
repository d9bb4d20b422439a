// Library re-exports for the integration tests
// Everything lives in the daemon's module tree; this file exposes it as a
// library without reorganizing the binary.
//
// Note: Many items appear as "dead code" in library checks because they're
// primarily used by the binary (main.rs). This is expected for a daemon.
#![allow(dead_code)]

include!("./main.rs");
