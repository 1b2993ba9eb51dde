pub mod activity;
pub mod approvals;
pub mod brake;
pub mod profiles;
pub mod system;
pub mod tasks;

pub use activity::*;
pub use approvals::*;
pub use brake::*;
pub use profiles::*;
pub use system::*;
pub use tasks::*;
