//! Session lifecycle and membership.

mod registry;

pub use registry::{
    AddMemberOutcome, CreatedSession, ExpiredSession, MemberView, RemoveOutcome, SessionRegistry,
};
