pub mod commerce;
pub mod orders;
pub mod payments;
