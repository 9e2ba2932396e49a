pub mod backup;
pub mod classes;
pub mod core;
pub mod grades;
pub mod payments;
pub mod roster_exchange;
pub mod students;
