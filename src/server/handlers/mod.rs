pub mod callback;
pub mod deliveries;
pub mod health;
