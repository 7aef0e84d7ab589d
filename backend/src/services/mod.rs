pub mod ai;
pub mod credits;
pub mod invalidation;
pub mod stripe;
