pub mod attachments;
pub mod auth;
pub mod events;
pub mod findings;
pub mod installations;
pub mod profiles;
pub mod runs;
pub mod work_items;
