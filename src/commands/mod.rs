mod down;
mod order;
mod reports;
mod status;
mod up;
mod validate;

pub use down::run_down;
pub use order::run_order;
pub use reports::run_reports;
pub use status::run_status;
pub use up::run_up;
pub use validate::run_validate;
