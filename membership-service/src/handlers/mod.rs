pub mod health;
pub mod memberships;
pub mod webhooks;

pub use health::{health_check, metrics_handler, readiness_check};
pub use memberships::{
    cancel_membership, create_membership, get_membership, pause_membership,
    reactivate_membership, recover_payment, resume_membership,
};
pub use webhooks::receive_billing_event;
