/// Payment lifecycle events and their routes.
pub mod payment;
