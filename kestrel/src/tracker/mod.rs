mod identity;
mod process;

pub(crate) use identity::IdentityContext;
pub(crate) use process::KsProcessTracker;
