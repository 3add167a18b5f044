pub mod interfaces;
pub mod multicaster;
pub mod publisher;
pub mod receiver;
pub mod tracked;
