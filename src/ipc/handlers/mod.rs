pub mod backup;
pub mod books;
pub mod circulation;
pub mod core;
pub mod members;
pub mod payments;
pub mod reservations;
pub mod schools;
pub mod settings;
