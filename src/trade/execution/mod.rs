pub mod broker_box;
pub mod lifecycle;
