pub mod agent;
pub mod catalog;
pub mod customers;
pub mod orders;
pub mod provisioning;
