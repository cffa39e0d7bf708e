pub mod employee;
pub mod session;
pub mod slip;
