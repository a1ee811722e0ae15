//! Registration, Membership and Election
//!
//! The protocol core: ephemeral sequential registration with session-loss
//! recovery, server set membership with a live member view, and
//! lowest-sequence leader election on top of the same registration.

mod registration;
mod membership;
pub mod election;

pub use registration::{Registration, RegistrationState};
pub use membership::{
    HostSetWatch, Member, MembershipHandle, MembershipSnapshot, MembershipStatus, ServerSet,
};
pub use election::{
    DefunctReason, ElectionCandidate, LeaderElector, Leadership, LeadershipListener,
    LeadershipState,
};
