pub mod accounts;
pub mod attendance;
pub mod backup;
pub mod calendar;
pub mod classes;
pub mod core;
pub mod employees;
pub mod fees;
pub mod inventory;
pub mod messages;
pub mod payroll;
pub mod reports;
pub mod schools;
pub mod students;
pub mod users;
