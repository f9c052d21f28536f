//! Server side: write leases, tombstones, the file service and its HTTP
//! facade.

pub mod handlers;
pub mod locks;
pub mod service;
pub mod tombstones;

pub use handlers::router;
pub use locks::LockManager;
pub use service::FileService;
pub use tombstones::TombstoneRegistry;
