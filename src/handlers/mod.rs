pub mod health;
pub mod orders;
pub mod payment_webhooks;
pub mod tasks;
