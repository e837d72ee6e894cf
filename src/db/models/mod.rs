//! Database models split into domain-specific modules.

pub mod branch_commit;
pub mod route;
pub mod session;
pub mod settings;
pub mod site;

pub use branch_commit::*;
pub use route::*;
pub use session::*;
pub use settings::*;
pub use site::*;
