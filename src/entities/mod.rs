pub mod customer;
pub mod order;
pub mod product;
pub mod provisioning_task;
pub mod server;
pub mod subscription;
pub mod user_account;
