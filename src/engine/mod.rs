pub mod build_plan;
pub mod nixpacks;
pub mod ports;
pub mod sessions;
pub mod supervisor;

pub use build_plan::{BuildPlan, SiteType, Strategy};
pub use ports::{PortAllocator, PortRole};
pub use sessions::{SessionError, SessionManager};
pub use supervisor::{
    ContainerRecord, ContainerRole, ContainerStatus, ContainerSupervisor, CreateRequest, SupervisorError,
};
